//! PCM16 wire codec.
//!
//! Converts between the wire representation used on every audio message
//! (base64 of little-endian signed 16-bit PCM) and normalized `f32` samples.
//!
//! Negative samples are scaled by `1/32768` and non-negative samples by
//! `1/32767`, so that both `i16::MIN` and `i16::MAX` map exactly onto -1.0 and
//! 1.0 and encoding is the exact inverse of decoding.

use base64::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Scale used for negative samples.
const NEGATIVE_SCALE: f32 = 32768.0;

/// Scale used for zero and positive samples.
const POSITIVE_SCALE: f32 = 32767.0;

/// Errors produced while decoding an audio payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload is not valid base64 or does not hold whole 16-bit samples
    #[error("Malformed audio payload: {0}")]
    MalformedPayload(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// An immutable decoded audio frame (mono).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioChunk {
    /// Create a chunk from normalized samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Normalized samples in [-1, 1].
    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples in the chunk.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration derived from sample count and rate.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Duration of `samples` frames at `sample_rate`, rounded to the nanosecond.
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (samples as u128 * 1_000_000_000u128) / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

/// Decode a base64 PCM16LE payload into an [`AudioChunk`].
pub fn decode(payload: &str, sample_rate: u32) -> CodecResult<AudioChunk> {
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| CodecError::MalformedPayload(format!("invalid base64: {e}")))?;
    let samples = decode_samples(&bytes)?;
    Ok(AudioChunk::new(samples, sample_rate))
}

/// Convert raw PCM16LE bytes into normalized samples.
pub fn decode_samples(bytes: &[u8]) -> CodecResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MalformedPayload(format!(
            "odd byte length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| sample_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Encode normalized samples as a base64 PCM16LE payload.
pub fn encode(samples: &[f32]) -> String {
    BASE64_STANDARD.encode(encode_samples(samples))
}

/// Convert normalized samples into raw PCM16LE bytes.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&f32_to_sample(sample).to_le_bytes());
    }
    bytes
}

#[inline]
fn sample_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEGATIVE_SCALE
    } else {
        sample as f32 / POSITIVE_SCALE
    }
}

#[inline]
fn f32_to_sample(sample: f32) -> i16 {
    // NaN clamps to silence
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if clamped < 0.0 {
        (clamped * NEGATIVE_SCALE).round() as i16
    } else {
        (clamped * POSITIVE_SCALE).round() as i16
    }
}

/// Check that a payload only contains characters of the standard base64
/// alphabet, so it can be embedded in a JSON string without escaping.
pub fn is_wire_safe_base64(payload: &str) -> bool {
    !payload.is_empty()
        && payload
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// Estimate the decoded size of a base64 payload without decoding it.
#[inline]
pub fn estimated_decoded_len(payload: &str) -> usize {
    payload.len() * 3 / 4
}
