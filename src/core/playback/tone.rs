//! Acknowledgment tone synthesis.

use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// A single frequency sweep inside a tone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneSegment {
    pub start_hz: f32,
    pub end_hz: f32,
}

/// Parameters of a short acknowledgment sound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneSpec {
    /// Sweeps played back to back
    pub segments: Vec<ToneSegment>,
    /// Length of each segment in milliseconds
    pub segment_ms: u32,
    /// Linear fade-in per segment in milliseconds
    pub attack_ms: u32,
    /// Linear fade-out per segment in milliseconds
    pub release_ms: u32,
    /// Peak amplitude in [0, 1]
    pub gain: f32,
    pub sample_rate: u32,
}

impl Default for ToneSpec {
    /// Two-note rising chime.
    fn default() -> Self {
        Self {
            segments: vec![
                ToneSegment {
                    start_hz: 880.0,
                    end_hz: 880.0,
                },
                ToneSegment {
                    start_hz: 1320.0,
                    end_hz: 1320.0,
                },
            ],
            segment_ms: 60,
            attack_ms: 5,
            release_ms: 20,
            gain: 0.2,
            sample_rate: 24000,
        }
    }
}

impl ToneSpec {
    fn samples_per_segment(&self) -> usize {
        (self.sample_rate as u64 * self.segment_ms as u64 / 1000) as usize
    }

    /// Render the tone. The same spec always produces the same samples.
    pub fn synthesize(&self) -> Vec<f32> {
        let per_segment = self.samples_per_segment();
        if per_segment == 0 || self.sample_rate == 0 {
            return Vec::new();
        }

        let rate = self.sample_rate as f32;
        let attack = (self.sample_rate as u64 * self.attack_ms as u64 / 1000) as usize;
        let release = (self.sample_rate as u64 * self.release_ms as u64 / 1000) as usize;
        let gain = self.gain.clamp(0.0, 1.0);

        let mut out = Vec::with_capacity(per_segment * self.segments.len());
        for segment in &self.segments {
            let mut phase = 0.0f32;
            for n in 0..per_segment {
                let progress = n as f32 / per_segment as f32;
                let freq = segment.start_hz + (segment.end_hz - segment.start_hz) * progress;
                phase = (phase + TAU * freq / rate) % TAU;

                let mut envelope = 1.0f32;
                if attack > 0 && n < attack {
                    envelope = n as f32 / attack as f32;
                }
                let remaining = per_segment - n;
                if release > 0 && remaining <= release {
                    envelope = envelope.min(remaining as f32 / release as f32);
                }

                out.push(phase.sin() * envelope * gain);
            }
        }
        out
    }
}
