//! Microphone capture pipeline.
//!
//! Samples from a [`CaptureSource`] are cut into fixed-size frames, encoded
//! for the wire and tapped by an energy meter. A poll task watches the meter
//! while the detector is armed and reports a local barge-in as
//! [`CaptureEvent::InterruptDetected`].

pub mod energy;
pub mod framer;
pub mod pipeline;
pub mod source;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use energy::EnergyMeter;
pub use framer::Framer;
pub use pipeline::{CaptureEvent, CaptureFrame, CapturePipeline, CaptureStreams};
pub use source::{CaptureSource, ClientCaptureSource, ClientMicrophone, SampleStream};

/// Errors raised by the capture pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The input device is missing, already claimed or gone
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid capture configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Capture and local interrupt detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Input sample rate in Hz
    pub sample_rate: u32,
    /// Frame length sent upstream, in milliseconds
    pub frame_ms: u32,
    /// Span of recent audio the energy meter looks at, in milliseconds
    pub analysis_window_ms: u32,
    /// RMS level above which an armed detector reports a barge-in
    pub interrupt_threshold: f32,
    /// How often the detector samples the meter
    pub poll_interval: Duration,
    /// Capacity of the frame and event channels
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 100,
            analysis_window_ms: 32,
            interrupt_threshold: 0.05,
            poll_interval: Duration::from_millis(50),
            channel_capacity: 64,
        }
    }
}

impl CaptureConfig {
    /// Samples per emitted frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }

    /// Samples in the energy analysis window.
    pub fn window_samples(&self) -> usize {
        ((self.sample_rate as u64 * self.analysis_window_ms as u64 / 1000) as usize).max(1)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.sample_rate == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.frame_samples() == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "frame_ms must be positive".to_string(),
            ));
        }
        if !(self.interrupt_threshold > 0.0 && self.interrupt_threshold <= 1.0) {
            return Err(CaptureError::InvalidConfiguration(format!(
                "interrupt_threshold must be in (0, 1], got {}",
                self.interrupt_threshold
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(CaptureError::InvalidConfiguration(
                "poll_interval must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
