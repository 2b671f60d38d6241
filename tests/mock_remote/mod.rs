//! Scripted model channel and recording playback sink
//!
//! The remote records everything the session sends and replays whatever
//! the test pushes through its event sender. The sink records every chunk
//! handed to playback and every halt.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use avatar_relay::auth::{AuthClaims, AuthError, AuthResult, TokenVerifier};
use avatar_relay::core::codec::{self, AudioChunk};
use avatar_relay::core::playback::{ChunkId, ChunkKind, PlaybackSink, ScheduledChunk};
use avatar_relay::core::remote::{
    BoxedRemote, RemoteChannel, RemoteConnector, RemoteError, RemoteEvent, RemoteInput,
    RemoteResult,
};

/// Test side of a [`ScriptedRemote`].
#[derive(Clone)]
pub struct RemoteScript {
    pub sent: Arc<Mutex<Vec<RemoteInput>>>,
    pub events: mpsc::Sender<RemoteEvent>,
    pub closes: Arc<AtomicUsize>,
}

impl RemoteScript {
    pub async fn push(&self, event: RemoteEvent) {
        self.events
            .send(event)
            .await
            .expect("session stopped reading model events");
    }

    /// Push `count` speech chunks of `chunk_ms` each at 24 kHz.
    pub async fn push_speech(&self, count: usize, chunk_ms: u64) {
        for _ in 0..count {
            self.push(RemoteEvent::Audio(speech_payload(chunk_ms))).await;
        }
    }

    pub fn sent(&self) -> Vec<RemoteInput> {
        self.sent.lock().clone()
    }

    pub fn interrupts_sent(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|input| **input == RemoteInput::Interrupt)
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Model channel driven entirely by the test.
pub struct ScriptedRemote {
    sent: Arc<Mutex<Vec<RemoteInput>>>,
    events: Option<mpsc::Receiver<RemoteEvent>>,
    closes: Arc<AtomicUsize>,
    fail_sends: bool,
    interrupt_delay: Option<Duration>,
}

#[async_trait]
impl RemoteChannel for ScriptedRemote {
    async fn connect(&mut self) -> RemoteResult<mpsc::Receiver<RemoteEvent>> {
        self.events.take().ok_or(RemoteError::NotConnected)
    }

    async fn send(&self, input: RemoteInput) -> RemoteResult<()> {
        if self.fail_sends {
            return Err(RemoteError::ConnectionClosed("scripted failure".to_string()));
        }
        if input == RemoteInput::Interrupt
            && let Some(delay) = self.interrupt_delay
        {
            // Upstream queue stays full until the send times out
            tokio::time::sleep(delay).await;
            self.sent.lock().push(input);
            return Err(RemoteError::Timeout("interrupt send".to_string()));
        }
        self.sent.lock().push(input);
        Ok(())
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.events.is_none()
    }

    fn provider_info(&self) -> serde_json::Value {
        json!({"provider": "scripted"})
    }
}

pub fn scripted_remote() -> (BoxedRemote, RemoteScript) {
    build_remote(false, None)
}

/// A remote whose sends fail as if the connection dropped.
pub fn broken_remote() -> (BoxedRemote, RemoteScript) {
    build_remote(true, None)
}

/// A remote whose interrupt sends block for `delay` and then time out.
pub fn slow_interrupt_remote(delay: Duration) -> (BoxedRemote, RemoteScript) {
    build_remote(false, Some(delay))
}

fn build_remote(fail_sends: bool, interrupt_delay: Option<Duration>) -> (BoxedRemote, RemoteScript) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel(64);
    let remote = ScriptedRemote {
        sent: sent.clone(),
        events: Some(rx),
        closes: closes.clone(),
        fail_sends,
        interrupt_delay,
    };
    let script = RemoteScript {
        sent,
        events: tx,
        closes,
    };
    (Box::new(remote), script)
}

/// Connector handing out scripted remotes and keeping their scripts.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<Vec<RemoteScript>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the `index`th remote to be created.
    pub async fn script(&self, index: usize) -> RemoteScript {
        for _ in 0..200 {
            if let Some(script) = self.scripts.lock().get(index).cloned() {
                return script;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote {index} was never created");
    }
}

impl RemoteConnector for ScriptedConnector {
    fn create(&self) -> RemoteResult<BoxedRemote> {
        let (remote, script) = scripted_remote();
        self.scripts.lock().push(script);
        Ok(remote)
    }
}

/// Playback output that records instead of playing.
#[derive(Default)]
pub struct RecordingSink {
    played: Mutex<Vec<ScheduledChunk>>,
    halted: Mutex<Vec<ChunkId>>,
    halted_at: Mutex<Option<Instant>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn speech(&self) -> Vec<ScheduledChunk> {
        self.played
            .lock()
            .iter()
            .filter(|c| c.kind == ChunkKind::Speech)
            .copied()
            .collect()
    }

    pub fn tones(&self) -> Vec<ScheduledChunk> {
        self.played
            .lock()
            .iter()
            .filter(|c| c.kind == ChunkKind::Tone)
            .copied()
            .collect()
    }

    pub fn halted(&self) -> Vec<ChunkId> {
        self.halted.lock().clone()
    }

    /// When playback was first halted.
    pub fn first_halt(&self) -> Option<Instant> {
        *self.halted_at.lock()
    }
}

impl PlaybackSink for RecordingSink {
    fn play(&self, scheduled: &ScheduledChunk, _chunk: &AudioChunk) {
        self.played.lock().push(*scheduled);
    }

    fn halt(&self, ids: &[ChunkId]) {
        self.halted_at.lock().get_or_insert_with(Instant::now);
        self.halted.lock().extend_from_slice(ids);
    }
}

/// base64 PCM16 speech of `ms` milliseconds at 24 kHz.
pub fn speech_payload(ms: u64) -> String {
    let samples = (24_000 * ms / 1000) as usize;
    codec::encode(&vec![0.1; samples])
}

/// base64 PCM16 microphone audio of `ms` milliseconds at 16 kHz.
pub fn microphone_payload(ms: u64, level: f32) -> String {
    let samples = (16_000 * ms / 1000) as usize;
    codec::encode(&vec![level; samples])
}

/// Token that [`StaticVerifier`] accepts.
pub const VALID_TOKEN: &str = "valid-token";

/// Accepts [`VALID_TOKEN`] as user `visitor-42` and nothing else.
pub struct StaticVerifier;

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> AuthResult<AuthClaims> {
        if token == VALID_TOKEN {
            Ok(AuthClaims {
                uid: "visitor-42".to_string(),
                email: Some("visitor@museum.example".to_string()),
                name: None,
                exp: u64::MAX,
            })
        } else {
            Err(AuthError::InvalidToken("signature mismatch".to_string()))
        }
    }
}
