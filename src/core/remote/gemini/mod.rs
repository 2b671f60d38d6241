//! Gemini Live API module.
//!
//! Bidirectional audio streaming against Google's Gemini Live
//! (BidiGenerateContent) WebSocket API.
//!
//! # Supported Voices
//!
//! Puck, Charon, Kore, Fenrir, Aoede, Zubenelgenubi, Orion, Pegasus, Vega,
//! Algenib, Alkaid, Altair, Castor, Polaris
//!
//! # Audio Format
//!
//! Input is PCM 16-bit little-endian at 16kHz, output at 24kHz.

mod client;
mod config;
pub mod messages;

pub use client::{GeminiConnector, GeminiLive};
pub use config::{
    AUDIO_INPUT_MIME_TYPE, DEFAULT_GEMINI_MODEL, GEMINI_LIVE_URL, GeminiConfig, GeminiVoice,
    mask_api_key,
};
