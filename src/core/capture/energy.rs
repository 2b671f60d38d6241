use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Ring buffer over the most recent samples with RMS on demand.
///
/// A window that has not been refreshed for longer than the last block plus
/// the window itself reads as silence, so an input that stops sending never
/// keeps reporting the energy of old speech.
#[derive(Debug, Clone)]
pub struct EnergyMeter {
    window: VecDeque<f32>,
    capacity: usize,
    sample_rate: u32,
    fresh_until: Option<Instant>,
}

impl EnergyMeter {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate: sample_rate.max(1),
            fresh_until: None,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.push_at(samples, Instant::now());
    }

    /// Push a block received at `now`.
    pub fn push_at(&mut self, samples: &[f32], now: Instant) {
        if samples.is_empty() {
            return;
        }
        // Only the tail can survive
        let tail = &samples[samples.len().saturating_sub(self.capacity)..];
        let overflow = (self.window.len() + tail.len()).saturating_sub(self.capacity);
        self.window.drain(..overflow);
        self.window.extend(tail.iter().copied());

        let covered = self.span(samples.len()) + self.span(self.capacity);
        self.fresh_until = Some(now + covered);
    }

    /// Root mean square of the buffered window, 0 when empty or stale.
    pub fn rms(&self) -> f32 {
        self.rms_at(Instant::now())
    }

    pub fn rms_at(&self, now: Instant) -> f32 {
        match self.fresh_until {
            Some(until) if now <= until => {}
            _ => return 0.0,
        }
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.window.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / self.window.len() as f64).sqrt() as f32
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.fresh_until = None;
    }

    fn span(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.sample_rate as f64)
    }
}
