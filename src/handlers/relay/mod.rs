//! Browser relay WebSocket
//!
//! One WebSocket connection drives one model session. All frames are JSON
//! text; binary frames are rejected.
//!
//! ## Client → Server
//!
//! - **audio**: base64 PCM16 little-endian microphone audio at 16 kHz
//! - **text**: a user text turn
//! - **image**: base64 image, optional `mime_type` (defaults to JPEG)
//! - **tool_response**: results for a previous `tool_call`
//! - **interrupt**: user pressed stop; cuts the current reply
//! - **end**: explicit end of the user turn
//! - **mute** / **unmute**: gate the microphone without closing the session
//! - **auth**: `{"type": "auth", "token": ...}` when authentication is
//!   required and the upgrade carried no token; must be the first message.
//!   Any first message may carry an `auth_token` field instead.
//!
//! ## Server → Client
//!
//! - **authenticated** after a successful in-band `auth`
//! - `{"ready": true}` once the model session is established
//! - **audio**: base64 PCM16 model speech at 24 kHz
//! - **text**, **turn_complete**, **interrupted**, **avatar_state**
//! - **tool_call**, **go_away**, **error**
//!
//! ```json
//! {"type": "audio", "data": "AAAB..."}
//! {"type": "avatar_state", "data": "speaking"}
//! ```

mod handler;
pub mod messages;

pub use handler::relay_handler;
