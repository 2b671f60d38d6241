//! Base traits and types for the remote speech-to-speech model channel.
//!
//! A [`RemoteChannel`] is an opaque duplex stream: the session pushes
//! [`RemoteInput`] values into it and receives [`RemoteEvent`] values from the
//! receiver returned by [`RemoteChannel::connect`].
//!
//! # Audio Format
//!
//! Input audio is base64 PCM16LE at 16 kHz, output audio is base64 PCM16LE at
//! 24 kHz.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sample rate of audio sent to the model.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio produced by the model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

// =============================================================================
// Error Types
// =============================================================================

/// Client-facing error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    QuotaExceeded,
    ConnectionClosed,
    Timeout,
    General,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::QuotaExceeded => "quota_exceeded",
            ErrorCategory::ConnectionClosed => "connection_closed",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::General => "general",
        }
    }

    /// Suggested next step for the user.
    pub fn action(&self) -> &'static str {
        match self {
            ErrorCategory::QuotaExceeded => "Please wait and try again.",
            ErrorCategory::ConnectionClosed => "Please reconnect.",
            ErrorCategory::Timeout => "Please try again.",
            ErrorCategory::General => "Please refresh and try again.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the remote model channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Could not establish the connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Quota, rate limit or resource exhaustion reported by the model
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The connection was closed or reset
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// An operation did not finish in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Channel used before `connect` or after `close`
    #[error("Not connected")]
    NotConnected,

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Anything else the model reported
    #[error("Remote error: {0}")]
    General(String),
}

impl RemoteError {
    /// Classify a free-form failure message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("quota")
            || lower.contains("rate limit")
            || lower.contains("resource exhausted")
            || lower.contains("resource_exhausted")
        {
            RemoteError::QuotaExceeded(message)
        } else if lower.contains("connection closed")
            || lower.contains("connection reset")
            || lower.contains("broken pipe")
        {
            RemoteError::ConnectionClosed(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            RemoteError::Timeout(message)
        } else {
            RemoteError::General(message)
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RemoteError::QuotaExceeded(_) => ErrorCategory::QuotaExceeded,
            RemoteError::ConnectionFailed(_)
            | RemoteError::ConnectionClosed(_)
            | RemoteError::NotConnected => ErrorCategory::ConnectionClosed,
            RemoteError::Timeout(_) => ErrorCategory::Timeout,
            RemoteError::InvalidConfiguration(_)
            | RemoteError::SerializationError(_)
            | RemoteError::General(_) => ErrorCategory::General,
        }
    }

    pub fn action(&self) -> &'static str {
        self.category().action()
    }

    /// Whether the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RemoteError::QuotaExceeded(_)
                | RemoteError::ConnectionFailed(_)
                | RemoteError::ConnectionClosed(_)
                | RemoteError::NotConnected
                | RemoteError::InvalidConfiguration(_)
        )
    }
}

/// Result type for remote channel operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Connection retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total connection attempts, including the first.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after each failed attempt.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Upper bound of the random delay added to each wait (milliseconds).
    /// Default: 500ms
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_jitter_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// excluding jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64
            * (self.backoff_multiplier as f64).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay as u64)
    }

    /// Delay before retrying after failed attempt number `attempt`, jitter
    /// included.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + Duration::from_millis(rand_jitter(self.max_jitter_ms))
    }

    /// Check if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Pseudo-random value in `[0, max]` from a time-seeded LCG.
fn rand_jitter(max: u64) -> u64 {
    use std::time::SystemTime;
    if max == 0 {
        return 0;
    }
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31);
    random % (max + 1)
}

/// Per-kind deadlines for enqueueing outbound input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTimeouts {
    /// Audio frames; late audio is dropped
    pub audio: Duration,
    /// End of turn and interrupt signals
    pub control: Duration,
    /// Text, images and tool responses
    pub media: Duration,
}

impl Default for SendTimeouts {
    fn default() -> Self {
        Self {
            audio: Duration::from_secs(1),
            control: Duration::from_secs(1),
            media: Duration::from_secs(5),
        }
    }
}

impl SendTimeouts {
    pub fn for_input(&self, input: &RemoteInput) -> Duration {
        match input {
            RemoteInput::Audio(_) => self.audio,
            RemoteInput::EndOfTurn | RemoteInput::Interrupt => self.control,
            RemoteInput::Text(_) | RemoteInput::Image { .. } | RemoteInput::ToolResponse(_) => {
                self.media
            }
        }
    }
}

// =============================================================================
// Channel Messages
// =============================================================================

/// Input pushed to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteInput {
    /// base64 PCM16LE at [`INPUT_SAMPLE_RATE`]
    Audio(String),
    /// A user text turn
    Text(String),
    /// base64 encoded image
    Image { data: String, mime_type: String },
    /// The user finished speaking
    EndOfTurn,
    /// The user barged in; drop the rest of the current model turn
    Interrupt,
    /// Result of a tool call, passed through as-is
    ToolResponse(serde_json::Value),
}

impl RemoteInput {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteInput::Audio(_) => "audio",
            RemoteInput::Text(_) => "text",
            RemoteInput::Image { .. } => "image",
            RemoteInput::EndOfTurn => "end",
            RemoteInput::Interrupt => "interrupt",
            RemoteInput::ToolResponse(_) => "tool_response",
        }
    }

    /// Audio and control input is dropped on timeout rather than reported.
    pub fn is_realtime(&self) -> bool {
        matches!(
            self,
            RemoteInput::Audio(_) | RemoteInput::EndOfTurn | RemoteInput::Interrupt
        )
    }
}

/// Events received from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The model acknowledged the session setup
    SetupComplete,
    /// base64 PCM16LE at [`OUTPUT_SAMPLE_RATE`]
    Audio(String),
    Text(String),
    /// The model finished its turn
    TurnComplete,
    /// The model stopped its turn because the user spoke
    Interrupted,
    /// Tool invocation requested by the model, passed through as-is
    ToolCall(serde_json::Value),
    Usage { total_tokens: u64 },
    /// The server will close the connection soon
    GoAway { time_left: Option<String> },
    Error(RemoteError),
    /// The stream ended
    Closed,
}

// =============================================================================
// Base Trait
// =============================================================================

/// Duplex channel to a speech-to-speech model.
///
/// # Example
///
/// ```rust,ignore
/// use avatar_relay::core::remote::{GeminiConfig, GeminiLive, RemoteChannel, RemoteInput};
///
/// let mut remote = GeminiLive::new(GeminiConfig::new("AIza..."))?;
/// let mut events = remote.connect().await?;
///
/// remote.send(RemoteInput::Text("Hello".to_string())).await?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Connect and complete the session setup.
    ///
    /// Events arrive on the returned receiver until the channel closes.
    async fn connect(&mut self) -> RemoteResult<mpsc::Receiver<RemoteEvent>>;

    /// Enqueue input for the model.
    async fn send(&self, input: RemoteInput) -> RemoteResult<()>;

    /// Close the connection. Idempotent.
    async fn close(&mut self) -> RemoteResult<()>;

    /// Check if the channel is connected and set up.
    fn is_ready(&self) -> bool;

    /// Provider details for logs and diagnostics.
    fn provider_info(&self) -> serde_json::Value;
}

/// Boxed trait object for remote channels.
pub type BoxedRemote = Box<dyn RemoteChannel>;

/// Creates one remote channel per session.
pub trait RemoteConnector: Send + Sync {
    fn create(&self) -> RemoteResult<BoxedRemote>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            RemoteError::classify("429 Resource Exhausted").category(),
            ErrorCategory::QuotaExceeded
        );
        assert_eq!(
            RemoteError::classify("You exceeded your current quota").category(),
            ErrorCategory::QuotaExceeded
        );
        assert_eq!(
            RemoteError::classify("Connection reset by peer").category(),
            ErrorCategory::ConnectionClosed
        );
        assert_eq!(
            RemoteError::classify("request timed out").category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            RemoteError::classify("model overloaded").category(),
            ErrorCategory::General
        );
    }

    #[test]
    fn test_fatal_categories() {
        assert!(RemoteError::QuotaExceeded("q".into()).is_fatal());
        assert!(RemoteError::ConnectionClosed("c".into()).is_fatal());
        assert!(!RemoteError::Timeout("t".into()).is_fatal());
        assert!(!RemoteError::General("g".into()).is_fatal());
    }

    #[test]
    fn test_actions() {
        assert_eq!(
            RemoteError::QuotaExceeded(String::new()).action(),
            "Please wait and try again."
        );
        assert_eq!(ErrorCategory::ConnectionClosed.to_string(), "connection_closed");
    }

    #[test]
    fn test_retry_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay(1), Duration::from_millis(1000));
        assert_eq!(config.base_delay(2), Duration::from_millis(2000));

        let delay = config.calculate_delay(1);
        assert!(delay >= Duration::from_millis(1000) && delay <= Duration::from_millis(1500));

        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn test_send_timeouts_per_kind() {
        let timeouts = SendTimeouts::default();
        assert_eq!(
            timeouts.for_input(&RemoteInput::Audio(String::new())),
            Duration::from_secs(1)
        );
        assert_eq!(timeouts.for_input(&RemoteInput::Interrupt), Duration::from_secs(1));
        assert_eq!(
            timeouts.for_input(&RemoteInput::Text("hi".into())),
            Duration::from_secs(5)
        );
        assert!(RemoteInput::EndOfTurn.is_realtime());
        assert!(!RemoteInput::ToolResponse(serde_json::json!({})).is_realtime());
    }
}
