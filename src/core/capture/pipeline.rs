use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::{CaptureConfig, CaptureResult, CaptureSource, EnergyMeter, Framer, SampleStream};
use crate::core::codec;

/// One wire-encoded microphone frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    /// base64 PCM16LE at the capture rate
    pub payload: String,
    pub samples: usize,
}

/// Events raised by the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureEvent {
    /// Microphone energy crossed the interrupt threshold while armed.
    InterruptDetected { rms: f32 },
}

/// Output channels of a running pipeline.
#[derive(Debug)]
pub struct CaptureStreams {
    pub frames: mpsc::Receiver<CaptureFrame>,
    pub events: mpsc::Receiver<CaptureEvent>,
}

/// A running capture graph: source, framing tap and interrupt detector.
pub struct CapturePipeline {
    config: CaptureConfig,
    source: Box<dyn CaptureSource>,
    attached: watch::Sender<bool>,
    armed: Arc<AtomicBool>,
    meter: Arc<Mutex<EnergyMeter>>,
    tap_task: Option<JoinHandle<()>>,
    detector_task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Acquire `source` and spawn the tap and detector tasks.
    ///
    /// The detector starts disarmed.
    pub fn start(
        config: CaptureConfig,
        mut source: Box<dyn CaptureSource>,
    ) -> CaptureResult<(Self, CaptureStreams)> {
        config.validate()?;
        let samples = source.open(&config)?;

        let (frames_tx, frames_rx) = mpsc::channel(config.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (attached_tx, attached_rx) = watch::channel(true);
        let armed = Arc::new(AtomicBool::new(false));
        let meter = Arc::new(Mutex::new(EnergyMeter::new(
            config.window_samples(),
            config.sample_rate,
        )));

        let tap_task = tokio::spawn(run_tap(
            samples,
            Framer::new(config.frame_samples()),
            meter.clone(),
            attached_rx,
            frames_tx,
        ));

        let detector_task = tokio::spawn(run_detector(
            config.clone(),
            meter.clone(),
            armed.clone(),
            events_tx,
        ));

        info!(
            sample_rate = config.sample_rate,
            frame_ms = config.frame_ms,
            threshold = config.interrupt_threshold,
            "Capture pipeline started"
        );

        Ok((
            Self {
                config,
                source,
                attached: attached_tx,
                armed,
                meter,
                tap_task: Some(tap_task),
                detector_task: Some(detector_task),
            },
            CaptureStreams {
                frames: frames_rx,
                events: events_rx,
            },
        ))
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Detach the tap. No sample is read or analysed until [`unmute`](Self::unmute).
    pub fn mute(&self) {
        let changed = self.attached.send_if_modified(|attached| {
            let was = *attached;
            *attached = false;
            was
        });
        if changed {
            self.meter.lock().clear();
            debug!("Capture muted");
        }
    }

    /// Reattach the tap.
    pub fn unmute(&self) {
        let changed = self.attached.send_if_modified(|attached| {
            let was = *attached;
            *attached = true;
            !was
        });
        if changed {
            debug!("Capture unmuted");
        }
    }

    pub fn is_muted(&self) -> bool {
        !*self.attached.borrow()
    }

    /// Enable local interrupt detection.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Disable local interrupt detection.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Current RMS over the analysis window.
    pub fn level(&self) -> f32 {
        self.meter.lock().rms()
    }

    /// Abort both tasks and release the source. Idempotent.
    pub fn stop(&mut self) {
        let running = self.tap_task.is_some() || self.detector_task.is_some();
        if let Some(task) = self.tap_task.take() {
            task.abort();
        }
        if let Some(task) = self.detector_task.take() {
            task.abort();
        }
        self.disarm();
        if running {
            self.source.close();
            debug!("Capture pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.tap_task.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_tap(
    mut samples: SampleStream,
    mut framer: Framer,
    meter: Arc<Mutex<EnergyMeter>>,
    mut attached: watch::Receiver<bool>,
    frames: mpsc::Sender<CaptureFrame>,
) {
    loop {
        if !*attached.borrow_and_update() {
            framer.reset();
            if attached.changed().await.is_err() {
                break;
            }
            continue;
        }

        tokio::select! {
            biased;

            changed = attached.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            block = samples.recv() => {
                let Some(block) = block else {
                    debug!("Capture source ended");
                    break;
                };

                meter.lock().push(&block);
                for frame in framer.push(&block) {
                    let frame = CaptureFrame {
                        payload: codec::encode(&frame),
                        samples: frame.len(),
                    };
                    if frames.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn run_detector(
    config: CaptureConfig,
    meter: Arc<Mutex<EnergyMeter>>,
    armed: Arc<AtomicBool>,
    events: mpsc::Sender<CaptureEvent>,
) {
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if !armed.load(Ordering::Acquire) {
            continue;
        }

        let rms = meter.lock().rms();
        if rms > config.interrupt_threshold
            && armed
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(rms, "Local interrupt detected");
            if events.send(CaptureEvent::InterruptDetected { rms }).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::{CaptureError, ClientCaptureSource, ClientMicrophone};
    use std::time::Duration;

    fn start_client(config: CaptureConfig) -> (ClientMicrophone, CapturePipeline, CaptureStreams) {
        let (mic, source) = ClientCaptureSource::new(16);
        let (pipeline, streams) = CapturePipeline::start(config, Box::new(source)).unwrap();
        (mic, pipeline, streams)
    }

    #[tokio::test]
    async fn test_frames_are_encoded_per_boundary() {
        let (mic, _pipeline, mut streams) = start_client(CaptureConfig::default());

        mic.push(vec![0.25; 1000]);
        mic.push(vec![0.25; 2200]);

        for _ in 0..2 {
            let frame = streams.frames.recv().await.unwrap();
            assert_eq!(frame.samples, 1600);
            // 3200 bytes of PCM
            assert_eq!(codec::decode(&frame.payload, 16000).unwrap().len(), 1600);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_fires_once_then_disarms() {
        let (mic, pipeline, mut streams) = start_client(CaptureConfig::default());

        mic.push(vec![0.5; 1600]);
        pipeline.arm();

        let event = tokio::time::timeout(Duration::from_millis(200), streams.events.recv())
            .await
            .unwrap()
            .unwrap();
        let CaptureEvent::InterruptDetected { rms } = event;
        assert!(rms > 0.4);
        assert!(!pipeline.is_armed());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(streams.events.try_recv().is_err(), "detector must not self-rearm");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_input_does_not_trigger() {
        let (mic, pipeline, mut streams) = start_client(CaptureConfig::default());
        mic.push(vec![0.01; 1600]);
        pipeline.arm();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(streams.events.try_recv().is_err());
        assert!(pipeline.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_speech_does_not_trigger_after_input_stops() {
        let (mic, pipeline, mut streams) = start_client(CaptureConfig::default());
        mic.push(vec![0.5; 1600]);
        let _ = streams.frames.recv().await;

        // Client goes quiet without sending anything
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pipeline.level(), 0.0);

        pipeline.arm();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(streams.events.try_recv().is_err());
        assert!(pipeline.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_pipeline_processes_nothing() {
        let (mic, pipeline, mut streams) = start_client(CaptureConfig::default());
        pipeline.mute();
        pipeline.mute();
        assert!(pipeline.is_muted());

        mic.push(vec![0.9; 3200]);
        pipeline.arm();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(streams.frames.try_recv().is_err());
        assert!(streams.events.try_recv().is_err());
        assert_eq!(pipeline.level(), 0.0);

        pipeline.unmute();
        let frame = tokio::time::timeout(Duration::from_millis(100), streams.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.samples, 1600);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_mic, mut pipeline, _streams) = start_client(CaptureConfig::default());
        assert!(pipeline.is_running());
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(!pipeline.is_armed());
    }

    #[tokio::test]
    async fn test_start_fails_on_claimed_source() {
        let (mic, mut source) = ClientCaptureSource::new(4);
        let _stream = source.open(&CaptureConfig::default()).unwrap();

        let result = CapturePipeline::start(CaptureConfig::default(), Box::new(source));
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
        drop(mic);
    }
}
