//! Session protocol.
//!
//! One [`Session`] per client connection. It owns the remote model channel,
//! the capture pipeline and the playback scheduler, dispatches client
//! commands and model events one at a time, coordinates barge-in and
//! publishes the [`AvatarState`].

pub mod events;
pub mod machine;
pub mod registry;
pub mod sink;
pub mod state;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::capture::{CaptureConfig, CaptureError};
use crate::core::playback::ToneSpec;
use crate::core::remote::RemoteError;

pub use events::{ErrorNotice, InterruptSource, SessionCommand, SessionEvent};
pub use machine::{Session, SessionHandle, SessionIo};
pub use registry::SessionRegistry;
pub use sink::EventSink;
pub use state::{AvatarState, InterruptState, Lifecycle};

/// Errors that end a session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Remote channel error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// The session task is gone
    #[error("Session closed")]
    Closed,

    #[error("Invalid session configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Per-session tuning.
///
/// Loaded from the `session:` YAML section or the matching environment
/// variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiet period after an interrupt before listening resumes (ms)
    pub debounce_window_ms: u64,
    /// Triggers closer than this to the previous one are merged (ms)
    pub retrigger_window_ms: u64,
    /// RMS level that counts as the user barging in
    pub interrupt_rms_threshold: f32,
    /// Interrupt detector poll period (ms)
    pub interrupt_poll_interval_ms: u64,
    /// Play a short chime after a barge-in stops playback
    pub ack_tone: bool,
    /// Capacity of the command and event channels
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 150,
            retrigger_window_ms: 50,
            interrupt_rms_threshold: 0.05,
            interrupt_poll_interval_ms: 50,
            ack_tone: false,
            channel_capacity: 512,
        }
    }
}

impl SessionConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn retrigger_window(&self) -> Duration {
        Duration::from_millis(self.retrigger_window_ms)
    }

    /// Capture settings derived from this config.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            interrupt_threshold: self.interrupt_rms_threshold,
            poll_interval: Duration::from_millis(self.interrupt_poll_interval_ms),
            ..Default::default()
        }
    }

    pub fn ack_tone_spec(&self) -> Option<ToneSpec> {
        self.ack_tone.then(ToneSpec::default)
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.debounce_window_ms == 0 {
            return Err(SessionError::InvalidConfiguration(
                "debounce_window_ms must be positive".to_string(),
            ));
        }
        if self.retrigger_window_ms > self.debounce_window_ms {
            return Err(SessionError::InvalidConfiguration(format!(
                "retrigger_window_ms ({}) must not exceed debounce_window_ms ({})",
                self.retrigger_window_ms, self.debounce_window_ms
            )));
        }
        if self.channel_capacity == 0 {
            return Err(SessionError::InvalidConfiguration(
                "channel_capacity must be positive".to_string(),
            ));
        }
        self.capture_config()
            .validate()
            .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_windows() {
        let config = SessionConfig::default();
        assert_eq!(config.debounce_window(), Duration::from_millis(150));
        assert_eq!(config.retrigger_window(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
        assert!(config.ack_tone_spec().is_none());
    }

    #[test]
    fn test_capture_config_carries_detector_settings() {
        let config = SessionConfig {
            interrupt_rms_threshold: 0.2,
            interrupt_poll_interval_ms: 20,
            ..Default::default()
        };
        let capture = config.capture_config();
        assert_eq!(capture.interrupt_threshold, 0.2);
        assert_eq!(capture.poll_interval, Duration::from_millis(20));
        assert_eq!(capture.frame_samples(), 1600);
    }

    #[test]
    fn test_validation() {
        let config = SessionConfig {
            debounce_window_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            retrigger_window_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            interrupt_rms_threshold: 2.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_section_with_partial_fields() {
        let config: SessionConfig = serde_yaml::from_str("debounce_window_ms: 300\nack_tone: true\n").unwrap();
        assert_eq!(config.debounce_window_ms, 300);
        assert!(config.ack_tone);
        assert_eq!(config.retrigger_window_ms, 50);
    }
}
