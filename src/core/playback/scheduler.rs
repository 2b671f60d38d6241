use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::clock::AudioClock;
use super::tone::ToneSpec;
use crate::core::codec::AudioChunk;

// =============================================================================
// Types
// =============================================================================

/// Identifier of a scheduled chunk, unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// What a scheduled chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Model speech, counted for drain detection
    Speech,
    /// Acknowledgment tone, played out of band
    Tone,
}

/// Handle to a chunk placed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub id: ChunkId,
    pub kind: ChunkKind,
    /// Start time on the scheduler's clock
    pub start: Duration,
    /// End time on the scheduler's clock
    pub end: Duration,
}

impl ScheduledChunk {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Events yielded by [`PlaybackScheduler::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The last scheduled speech chunk finished playing.
    Drained,
}

/// Output device for scheduled audio.
///
/// Both methods are called from the session task and must not block.
pub trait PlaybackSink: Send + Sync {
    /// Start `chunk` at `scheduled.start`.
    fn play(&self, scheduled: &ScheduledChunk, chunk: &AudioChunk);

    /// Silence the given chunks immediately, including ones not yet started.
    fn halt(&self, ids: &[ChunkId]);
}

// =============================================================================
// Scheduler
// =============================================================================

/// Gap-free playback timeline.
///
/// Chunks are laid out back to back in arrival order: a chunk starts exactly
/// where the previous one ends, unless the timeline has fallen behind the
/// clock, in which case it starts now.
pub struct PlaybackScheduler {
    clock: Arc<dyn AudioClock>,
    sink: Arc<dyn PlaybackSink>,
    /// Next start time. `None` until the first chunk.
    cursor: Option<Duration>,
    /// Speech chunks not yet retired, ordered by start
    active: VecDeque<ScheduledChunk>,
    tones: Vec<ScheduledChunk>,
    next_id: u64,
    /// Set while speech has been scheduled since the last drain
    awaiting_drain: bool,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn AudioClock>, sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            clock,
            sink,
            cursor: None,
            active: VecDeque::new(),
            tones: Vec::new(),
            next_id: 0,
            awaiting_drain: false,
        }
    }

    /// Current clock position.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Next start time on the timeline, if anything was ever scheduled.
    pub fn cursor(&self) -> Option<Duration> {
        self.cursor
    }

    fn allocate_id(&mut self) -> ChunkId {
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Place `chunk` on the timeline and hand it to the sink.
    ///
    /// Returns `None` for an empty chunk, which has nothing to play.
    pub fn enqueue_and_schedule(&mut self, chunk: AudioChunk) -> Option<ScheduledChunk> {
        let duration = chunk.duration();
        if chunk.is_empty() || duration.is_zero() {
            warn!(
                samples = chunk.len(),
                sample_rate = chunk.sample_rate(),
                "Dropping zero-length audio chunk"
            );
            return None;
        }

        let now = self.clock.now();
        let start = match self.cursor {
            Some(cursor) if cursor >= now => cursor,
            _ => now,
        };

        let scheduled = ScheduledChunk {
            id: self.allocate_id(),
            kind: ChunkKind::Speech,
            start,
            end: start + duration,
        };

        self.cursor = Some(scheduled.end);
        self.active.push_back(scheduled);
        self.awaiting_drain = true;
        self.sink.play(&scheduled, &chunk);

        debug!(
            chunk = %scheduled.id,
            start_ms = start.as_secs_f64() * 1000.0,
            duration_ms = duration.as_secs_f64() * 1000.0,
            "Scheduled chunk"
        );

        Some(scheduled)
    }

    /// Halt everything on the timeline and reset the cursor to now.
    ///
    /// Safe to call repeatedly. A stop never produces [`PlaybackEvent::Drained`].
    pub fn stop(&mut self) {
        let now = self.clock.now();

        let ids: Vec<ChunkId> = self
            .active
            .drain(..)
            .chain(self.tones.drain(..))
            .map(|c| c.id)
            .collect();

        if !ids.is_empty() {
            debug!(halted = ids.len(), "Stopping playback");
            self.sink.halt(&ids);
        }

        self.cursor = Some(now);
        self.awaiting_drain = false;
    }

    /// Play an acknowledgment tone at the current time.
    ///
    /// Tones are halted by [`stop`](Self::stop) but never delay the drain.
    pub fn play_tone(&mut self, spec: &ToneSpec) -> Option<ScheduledChunk> {
        let chunk = AudioChunk::new(spec.synthesize(), spec.sample_rate);
        if chunk.is_empty() {
            return None;
        }

        let now = self.clock.now();
        let scheduled = ScheduledChunk {
            id: self.allocate_id(),
            kind: ChunkKind::Tone,
            start: now,
            end: now + chunk.duration(),
        };

        self.cursor = Some(now);
        self.tones.push(scheduled);
        self.sink.play(&scheduled, &chunk);
        Some(scheduled)
    }

    /// Retire finished chunks and report a drain once the timeline empties.
    pub fn poll(&mut self) -> Option<PlaybackEvent> {
        let now = self.clock.now();

        while let Some(front) = self.active.front() {
            if front.end <= now {
                self.active.pop_front();
            } else {
                break;
            }
        }
        self.tones.retain(|t| t.end > now);

        if self.awaiting_drain && self.active.is_empty() {
            self.awaiting_drain = false;
            return Some(PlaybackEvent::Drained);
        }
        None
    }

    /// When [`poll`](Self::poll) should next be called to observe a drain.
    pub fn next_deadline(&self) -> Option<Duration> {
        if !self.awaiting_drain {
            return None;
        }
        Some(self.active.back().map(|c| c.end).unwrap_or_default())
    }

    /// Whether any speech chunk is still playing or queued.
    pub fn has_active(&self) -> bool {
        let now = self.clock.now();
        self.active.iter().any(|c| c.end > now)
    }

    /// Speech chunks not yet retired.
    pub fn active_chunks(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.active.iter()
    }
}

impl fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("cursor", &self.cursor)
            .field("active", &self.active.len())
            .field("tones", &self.tones.len())
            .field("awaiting_drain", &self.awaiting_drain)
            .finish()
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Sink that discards audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn play(&self, _scheduled: &ScheduledChunk, _chunk: &AudioChunk) {}
    fn halt(&self, _ids: &[ChunkId]) {}
}
