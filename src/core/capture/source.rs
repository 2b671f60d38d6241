use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use super::{CaptureConfig, CaptureError, CaptureResult};

/// Stream of raw sample blocks produced by an open source.
pub type SampleStream = mpsc::Receiver<Vec<f32>>;

/// An audio input the pipeline can acquire.
pub trait CaptureSource: Send {
    /// Acquire the input. Fails with [`CaptureError::DeviceUnavailable`]
    /// when the device cannot be claimed.
    fn open(&mut self, config: &CaptureConfig) -> CaptureResult<SampleStream>;

    /// Release the input. Calling it on a closed source does nothing.
    fn close(&mut self);
}

/// Feeding side of a [`ClientCaptureSource`].
///
/// The relay pushes decoded client microphone audio through this handle.
#[derive(Debug)]
pub struct ClientMicrophone {
    tx: mpsc::Sender<Vec<f32>>,
    alive: Arc<AtomicBool>,
}

impl ClientMicrophone {
    /// Push a block of samples without waiting.
    ///
    /// Returns `false` when the block was dropped because the pipeline is
    /// not keeping up or the source was closed.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        match self.tx.try_send(samples) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Capture input backlog full, dropping samples");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for ClientMicrophone {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Capture source whose samples arrive from a remote client.
#[derive(Debug)]
pub struct ClientCaptureSource {
    rx: Option<mpsc::Receiver<Vec<f32>>>,
    feeder_alive: Arc<AtomicBool>,
}

impl ClientCaptureSource {
    /// Create a source and the handle that feeds it.
    pub fn new(capacity: usize) -> (ClientMicrophone, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let alive = Arc::new(AtomicBool::new(true));
        (
            ClientMicrophone {
                tx,
                alive: alive.clone(),
            },
            Self {
                rx: Some(rx),
                feeder_alive: alive,
            },
        )
    }
}

impl CaptureSource for ClientCaptureSource {
    fn open(&mut self, _config: &CaptureConfig) -> CaptureResult<SampleStream> {
        if !self.feeder_alive.load(Ordering::Acquire) {
            return Err(CaptureError::DeviceUnavailable(
                "client microphone disconnected".to_string(),
            ));
        }
        let rx = self.rx.take().ok_or_else(|| {
            CaptureError::DeviceUnavailable("client microphone already claimed".to_string())
        })?;
        Ok(rx)
    }

    fn close(&mut self) {
        self.rx = None;
    }
}
