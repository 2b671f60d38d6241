//! Relay WebSocket message types
//!
//! Every client frame is one JSON object `{"type": ..., "data": ...}`.
//! Inbound frames are parsed into [`SessionCommand`]s; [`SessionEvent`]s are
//! serialized back out by [`to_wire`].

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::borrow::Cow;
use thiserror::Error;

use crate::core::codec;
use crate::session::{AvatarState, ErrorNotice, InterruptSource, SessionCommand, SessionEvent};

/// Maximum WebSocket frame and message size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum decoded size of one audio message (10 MiB)
pub const MAX_AUDIO_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum decoded size of one image (5 MiB)
pub const MAX_IMAGE_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Maximum text message length in characters
pub const MAX_TEXT_LENGTH: usize = 100_000;

pub const DEFAULT_IMAGE_MIME_TYPE: &str = "image/jpeg";

/// A client frame the relay refuses to act on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Invalid JSON message: {0}")]
    InvalidJson(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing data for '{0}' message")]
    MissingData(&'static str),

    #[error("Invalid data for '{kind}' message: {reason}")]
    InvalidData { kind: &'static str, reason: String },

    #[error("'{kind}' message too large ({size} > {limit})")]
    TooLarge {
        kind: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("Binary frames are not supported")]
    BinaryFrame,

    /// An `auth` message on a connection that is already authenticated
    #[error("Connection already authenticated")]
    AlreadyAuthenticated,
}

impl ProtocolViolation {
    /// Client-facing error for this violation.
    pub fn notice(&self) -> ErrorNotice {
        ErrorNotice::new("invalid_message", self.to_string())
            .with_action("Please check the message format.")
    }
}

// =============================================================================
// Incoming Messages (Client -> Relay)
// =============================================================================

#[derive(Deserialize)]
struct RawClientMessage<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Parse one client text frame.
pub fn parse_client_message(text: &str) -> Result<SessionCommand, ProtocolViolation> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolViolation::TooLarge {
            kind: "message",
            size: text.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }

    let raw: RawClientMessage<'_> =
        serde_json::from_str(text).map_err(|e| ProtocolViolation::InvalidJson(e.to_string()))?;

    match raw.kind.as_ref() {
        "audio" => {
            let data = string_data("audio", raw.data)?;
            let size = codec::estimated_decoded_len(&data);
            if size > MAX_AUDIO_SIZE_BYTES {
                return Err(ProtocolViolation::TooLarge {
                    kind: "audio",
                    size,
                    limit: MAX_AUDIO_SIZE_BYTES,
                });
            }
            Ok(SessionCommand::Audio(data))
        }
        "text" => {
            let data = string_data("text", raw.data)?;
            let length = data.chars().count();
            if length > MAX_TEXT_LENGTH {
                return Err(ProtocolViolation::TooLarge {
                    kind: "text",
                    size: length,
                    limit: MAX_TEXT_LENGTH,
                });
            }
            Ok(SessionCommand::Text(data))
        }
        "image" => {
            let data = string_data("image", raw.data)?;
            let size = codec::estimated_decoded_len(&data);
            if size > MAX_IMAGE_SIZE_BYTES {
                return Err(ProtocolViolation::TooLarge {
                    kind: "image",
                    size,
                    limit: MAX_IMAGE_SIZE_BYTES,
                });
            }
            let mime_type = raw
                .mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_IMAGE_MIME_TYPE.to_string());
            Ok(SessionCommand::Image { data, mime_type })
        }
        "tool_response" => {
            let data = raw
                .data
                .ok_or(ProtocolViolation::MissingData("tool_response"))?;
            let value = serde_json::from_str(data.get()).map_err(|e| {
                ProtocolViolation::InvalidData {
                    kind: "tool_response",
                    reason: e.to_string(),
                }
            })?;
            Ok(SessionCommand::ToolResponse(value))
        }
        "interrupt" => Ok(SessionCommand::Interrupt),
        "end" => Ok(SessionCommand::EndOfTurn),
        "mute" => Ok(SessionCommand::Mute),
        "unmute" => Ok(SessionCommand::Unmute),
        "auth" => Err(ProtocolViolation::AlreadyAuthenticated),
        other => Err(ProtocolViolation::UnknownType(truncate(other, 64))),
    }
}

#[derive(Deserialize)]
struct RawAuthFields<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
    #[serde(borrow, default)]
    token: Option<Cow<'a, str>>,
    #[serde(borrow, default)]
    auth_token: Option<Cow<'a, str>>,
}

/// A token presented inside a client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    pub token: String,
    /// The frame was a dedicated `auth` message with nothing else to act on
    pub standalone: bool,
}

/// Find a token in a client frame: `{"type":"auth","token":...}`, or an
/// `auth_token` field on any other message.
pub fn parse_client_auth(text: &str) -> Option<ClientAuth> {
    if text.len() > MAX_MESSAGE_SIZE {
        return None;
    }
    let raw: RawAuthFields<'_> = serde_json::from_str(text).ok()?;
    if raw.kind == "auth" {
        return raw.token.map(|token| ClientAuth {
            token: token.into_owned(),
            standalone: true,
        });
    }
    raw.auth_token.map(|token| ClientAuth {
        token: token.into_owned(),
        standalone: false,
    })
}

fn string_data(kind: &'static str, data: Option<&RawValue>) -> Result<String, ProtocolViolation> {
    let data = data.ok_or(ProtocolViolation::MissingData(kind))?;
    serde_json::from_str::<String>(data.get()).map_err(|_| ProtocolViolation::InvalidData {
        kind,
        reason: "expected a string".to_string(),
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// =============================================================================
// Outgoing Messages (Relay -> Client)
// =============================================================================

pub const INTERRUPTED_MESSAGE: &str = "Response interrupted";
pub const GO_AWAY_MESSAGE: &str = "Server closing session";

/// Messages sent to the client, other than `ready` and `audio`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayOutgoingMessage<'a> {
    Authenticated {
        uid: &'a str,
    },
    SetupComplete,
    Text(&'a str),
    TurnComplete,
    Interrupted {
        message: &'static str,
        source: InterruptSource,
    },
    AvatarState(AvatarState),
    Error(&'a ErrorNotice),
    GoAway {
        message: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_left: Option<&'a str>,
    },
    ToolCall(&'a serde_json::Value),
}

const READY_MESSAGE: &str = r#"{"ready":true}"#;

/// Serialize a session event as a client text frame.
///
/// Returns `None` for [`SessionEvent::Closed`], which ends the socket
/// instead of producing a message.
pub fn to_wire(event: &SessionEvent) -> Option<String> {
    let message = match event {
        SessionEvent::Ready => return Some(READY_MESSAGE.to_string()),
        SessionEvent::Audio { payload } => return Some(audio_message(payload)),
        SessionEvent::Closed => return None,
        SessionEvent::SetupComplete => RelayOutgoingMessage::SetupComplete,
        SessionEvent::Text(text) => RelayOutgoingMessage::Text(text),
        SessionEvent::TurnComplete => RelayOutgoingMessage::TurnComplete,
        SessionEvent::Interrupted { source } => RelayOutgoingMessage::Interrupted {
            message: INTERRUPTED_MESSAGE,
            source: *source,
        },
        SessionEvent::Avatar(state) => RelayOutgoingMessage::AvatarState(*state),
        SessionEvent::Error(notice) => RelayOutgoingMessage::Error(notice),
        SessionEvent::GoAway { time_left } => RelayOutgoingMessage::GoAway {
            message: GO_AWAY_MESSAGE,
            time_left: time_left.as_deref(),
        },
        SessionEvent::ToolCall(value) => RelayOutgoingMessage::ToolCall(value),
    };
    serde_json::to_string(&message).ok()
}

/// Build an `audio` frame by concatenation. Falls back to the serializer
/// when the payload is not plain base64.
pub fn audio_message(payload: &str) -> String {
    if codec::is_wire_safe_base64(payload) {
        let mut out = String::with_capacity(payload.len() + 28);
        out.push_str(r#"{"type":"audio","data":""#);
        out.push_str(payload);
        out.push_str(r#""}"#);
        out
    } else {
        serde_json::json!({"type": "audio", "data": payload}).to_string()
    }
}
