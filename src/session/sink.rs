use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::events::SessionEvent;
use crate::core::codec::{self, AudioChunk};
use crate::core::playback::{ChunkId, ChunkKind, PlaybackSink, ScheduledChunk};

/// Playback sink that forwards scheduled speech to the client as
/// [`SessionEvent::Audio`].
///
/// The client plays chunks in the order it receives them, which is the
/// scheduler's timeline order. Tones stay local; halting is signalled to the
/// client by the session's `interrupted` event.
#[derive(Debug, Clone)]
pub struct EventSink {
    events: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self { events }
    }
}

impl PlaybackSink for EventSink {
    fn play(&self, scheduled: &ScheduledChunk, chunk: &AudioChunk) {
        if scheduled.kind != ChunkKind::Speech {
            return;
        }

        let event = SessionEvent::Audio {
            payload: codec::encode(chunk.samples()),
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(chunk = %scheduled.id, "Client event queue full, dropping audio");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(chunk = %scheduled.id, "Client gone, dropping audio");
            }
        }
    }

    fn halt(&self, ids: &[ChunkId]) {
        debug!(halted = ids.len(), "Client playback halted");
    }
}
