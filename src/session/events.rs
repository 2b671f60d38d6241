use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::AvatarState;
use crate::core::remote::{ErrorCategory, RemoteError};

/// Commands a client sends into its session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// base64 PCM16LE microphone audio at 16 kHz
    Audio(String),
    Text(String),
    Image { data: String, mime_type: String },
    /// The user finished a turn
    EndOfTurn,
    /// The client detected a barge-in itself
    Interrupt,
    ToolResponse(serde_json::Value),
    Mute,
    Unmute,
    /// End the session
    Shutdown,
}

impl SessionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::Audio(_) => "audio",
            SessionCommand::Text(_) => "text",
            SessionCommand::Image { .. } => "image",
            SessionCommand::EndOfTurn => "end",
            SessionCommand::Interrupt => "interrupt",
            SessionCommand::ToolResponse(_) => "tool_response",
            SessionCommand::Mute => "mute",
            SessionCommand::Unmute => "unmute",
            SessionCommand::Shutdown => "shutdown",
        }
    }
}

/// Who started an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptSource {
    /// Local energy detector
    Local,
    /// Explicit client `interrupt` message
    Client,
    /// The model reported `interrupted`
    Remote,
}

impl InterruptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptSource::Local => "local",
            InterruptSource::Client => "client",
            InterruptSource::Remote => "remote",
        }
    }
}

impl fmt::Display for InterruptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub error_type: String,
}

impl ErrorNotice {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action: None,
            error_type: error_type.into(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

impl From<&RemoteError> for ErrorNotice {
    fn from(err: &RemoteError) -> Self {
        let category = err.category();
        let message = match category {
            ErrorCategory::QuotaExceeded => "API quota exceeded.".to_string(),
            ErrorCategory::ConnectionClosed => {
                "Connection to the model was lost.".to_string()
            }
            ErrorCategory::Timeout => "Request timeout".to_string(),
            ErrorCategory::General => "An error occurred".to_string(),
        };
        ErrorNotice::new(category.as_str(), message).with_action(category.action())
    }
}

/// Events a session reports to its client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session is established
    Ready,
    /// The model acknowledged setup
    SetupComplete,
    /// A scheduled chunk of model audio, base64 PCM16LE at 24 kHz
    Audio { payload: String },
    Text(String),
    TurnComplete,
    Interrupted { source: InterruptSource },
    Avatar(AvatarState),
    Error(ErrorNotice),
    GoAway { time_left: Option<String> },
    ToolCall(serde_json::Value),
    /// The session ended; no further events follow
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_from_remote_error() {
        let notice = ErrorNotice::from(&RemoteError::QuotaExceeded("429".into()));
        assert_eq!(notice.error_type, "quota_exceeded");
        assert_eq!(notice.message, "API quota exceeded.");
        assert_eq!(notice.action.as_deref(), Some("Please wait and try again."));
    }

    #[test]
    fn test_notice_serialization_skips_missing_action() {
        let json = serde_json::to_string(&ErrorNotice::new("invalid_message", "bad")).unwrap();
        assert_eq!(json, r#"{"message":"bad","error_type":"invalid_message"}"#);
    }

    #[test]
    fn test_command_kinds() {
        assert_eq!(SessionCommand::EndOfTurn.kind(), "end");
        assert_eq!(SessionCommand::Audio(String::new()).kind(), "audio");
        assert_eq!(InterruptSource::Local.to_string(), "local");
    }
}
