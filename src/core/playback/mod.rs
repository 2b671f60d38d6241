//! Playback scheduling for model audio.
//!
//! The [`PlaybackScheduler`] keeps a single timeline cursor and lays decoded
//! chunks out back to back on an [`AudioClock`], handing each one to a
//! [`PlaybackSink`]. It reports [`PlaybackEvent::Drained`] when the last
//! scheduled chunk has finished and supports an immediate, idempotent hard
//! stop used for barge-in.

pub mod clock;
pub mod scheduler;
pub mod tone;

pub use clock::{AudioClock, ManualClock, MonotonicClock};
pub use scheduler::{
    ChunkId, ChunkKind, NullSink, PlaybackEvent, PlaybackScheduler, PlaybackSink, ScheduledChunk,
};
pub use tone::{ToneSegment, ToneSpec};
