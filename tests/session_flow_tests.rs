//! Session Flow Tests
//!
//! Drives a full session against a scripted model channel under a paused
//! tokio clock: speech scheduling, drain detection, barge-in, debounce and
//! teardown.

mod mock_remote;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use avatar_relay::core::playback::PlaybackSink;
use avatar_relay::core::remote::{BoxedRemote, RemoteEvent, RemoteInput};
use avatar_relay::session::{
    AvatarState, InterruptSource, Session, SessionCommand, SessionConfig, SessionEvent,
    SessionHandle, SessionIo, SessionResult,
};

use mock_remote::{
    RecordingSink, RemoteScript, broken_remote, microphone_payload, scripted_remote,
    slow_interrupt_remote,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    handle: SessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    script: RemoteScript,
    sink: Arc<RecordingSink>,
    task: JoinHandle<SessionResult<()>>,
    seen: Vec<(Instant, SessionEvent)>,
}

fn start(config: SessionConfig) -> Harness {
    let (remote, script) = scripted_remote();
    start_with(config, remote, script)
}

fn start_with(config: SessionConfig, remote: BoxedRemote, script: RemoteScript) -> Harness {
    let sink = RecordingSink::new();
    let mut io = SessionIo::client(64);
    io.sink = Some(sink.clone() as Arc<dyn PlaybackSink>);

    let (session, handle, events) = Session::new("flow", config, remote, io);
    let task = tokio::spawn(session.run());
    Harness {
        handle,
        events,
        script,
        sink,
        task,
        seen: Vec::new(),
    }
}

impl Harness {
    /// Receive events until one matches, returning when it arrived.
    async fn wait_for(&mut self, wanted: SessionEvent) -> Instant {
        loop {
            let event = timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
                .unwrap_or_else(|| panic!("session ended before {wanted:?}"));
            let at = Instant::now();
            self.seen.push((at, event.clone()));
            if event == wanted {
                return at;
            }
        }
    }

    async fn listening(&mut self) -> Instant {
        self.wait_for(SessionEvent::Avatar(AvatarState::Listening)).await
    }

    fn avatar_history(&self) -> Vec<AvatarState> {
        self.seen
            .iter()
            .filter_map(|(_, e)| match e {
                SessionEvent::Avatar(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn interrupts_seen(&self) -> Vec<InterruptSource> {
        self.seen
            .iter()
            .filter_map(|(_, e)| match e {
                SessionEvent::Interrupted { source } => Some(*source),
                _ => None,
            })
            .collect()
    }

    /// Stop the session and collect every remaining event.
    async fn shutdown(mut self) -> Vec<SessionEvent> {
        self.handle.send(SessionCommand::Shutdown).await.unwrap();
        self.task.await.unwrap().unwrap();
        let mut rest = Vec::new();
        while let Some(event) = self.events.recv().await {
            rest.push(event);
        }
        rest
    }
}

#[tokio::test(start_paused = true)]
async fn test_speech_plays_gap_free_then_listens() {
    let mut h = start(SessionConfig::default());
    h.wait_for(SessionEvent::Ready).await;
    h.listening().await;

    let t0 = Instant::now();
    h.script.push_speech(5, 100).await;
    h.script.push(RemoteEvent::TurnComplete).await;

    h.wait_for(SessionEvent::TurnComplete).await;
    let listening_at = h.listening().await;

    // Listening only once the last chunk has played out
    let elapsed = listening_at - t0;
    assert!(elapsed >= Duration::from_millis(500), "listening after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(550), "listening after {elapsed:?}");

    let speech = h.sink.speech();
    assert_eq!(speech.len(), 5);
    for pair in speech.windows(2) {
        assert_eq!(pair[1].start, pair[0].end);
    }
    assert_eq!(
        speech[4].end - speech[0].start,
        Duration::from_millis(500)
    );

    assert_eq!(
        h.avatar_history(),
        vec![
            AvatarState::Listening,
            AvatarState::Speaking,
            AvatarState::Listening
        ]
    );
    assert!(h.sink.halted().is_empty());

    let rest = h.shutdown().await;
    assert_eq!(rest.last(), Some(&SessionEvent::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_turn_complete_after_drain_listens_immediately() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(2, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(*h.handle.avatar().borrow(), AvatarState::Speaking);

    let t_complete = Instant::now();
    h.script.push(RemoteEvent::TurnComplete).await;
    let listening_at = h.listening().await;
    assert_eq!(listening_at, t_complete);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_local_barge_in_stops_playback() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(10, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    let t_barge = Instant::now();
    h.handle
        .send(SessionCommand::Audio(microphone_payload(100, 0.5)))
        .await
        .unwrap();

    let interrupted_at = h
        .wait_for(SessionEvent::Interrupted {
            source: InterruptSource::Local,
        })
        .await;
    assert!(interrupted_at - t_barge <= Duration::from_millis(100));
    assert_eq!(*h.handle.avatar().borrow(), AvatarState::Idle);

    // Everything scheduled was halted and the model was told once
    assert_eq!(h.sink.halted().len(), 10);
    assert_eq!(h.script.interrupts_sent(), 1);

    // Stale model audio arriving during the debounce window is discarded
    h.script.push_speech(2, 100).await;

    let listening_at = h.listening().await;
    assert!(listening_at - interrupted_at >= Duration::from_millis(150));
    assert_eq!(h.sink.speech().len(), 10);
    assert_eq!(
        h.avatar_history(),
        vec![
            AvatarState::Listening,
            AvatarState::Speaking,
            AvatarState::Idle,
            AvatarState::Listening
        ]
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_playback_halts_before_slow_upstream_interrupt() {
    let (remote, script) = slow_interrupt_remote(Duration::from_secs(1));
    let mut h = start_with(SessionConfig::default(), remote, script);
    h.listening().await;

    h.script.push_speech(5, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    let triggered = Instant::now();
    h.handle.send(SessionCommand::Interrupt).await.unwrap();
    let interrupted_at = h
        .wait_for(SessionEvent::Interrupted {
            source: InterruptSource::Client,
        })
        .await;

    let halted_at = h.sink.first_halt().expect("playback was never halted");
    let stop_latency = halted_at - triggered;
    assert!(stop_latency < Duration::from_millis(50), "halted after {stop_latency:?}");
    assert!(interrupted_at - triggered < Duration::from_millis(50));
    assert_eq!(h.sink.halted().len(), 5);

    // The timed-out control send is dropped and the session carries on
    h.listening().await;
    assert!(!h.seen.iter().any(|(_, e)| matches!(e, SessionEvent::Error(_))));
    assert_eq!(h.script.interrupts_sent(), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_old_microphone_speech_does_not_interrupt_next_reply() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.handle
        .send(SessionCommand::Audio(microphone_payload(100, 0.5)))
        .await
        .unwrap();
    // Client stops sending audio altogether
    sleep(Duration::from_secs(5)).await;

    h.script.push_speech(5, 100).await;
    h.script.push(RemoteEvent::TurnComplete).await;
    h.wait_for(SessionEvent::TurnComplete).await;
    h.listening().await;

    assert!(h.interrupts_seen().is_empty());
    assert!(h.sink.halted().is_empty());
    assert_eq!(h.sink.speech().len(), 5);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_quiet_microphone_does_not_interrupt() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(5, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;
    h.handle
        .send(SessionCommand::Audio(microphone_payload(100, 0.01)))
        .await
        .unwrap();

    h.script.push(RemoteEvent::TurnComplete).await;
    h.listening().await;

    assert!(h.interrupts_seen().is_empty());
    assert!(h.sink.halted().is_empty());
    assert_eq!(h.script.interrupts_sent(), 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_interrupt_ignored_during_local_interrupt() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(10, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;
    h.handle
        .send(SessionCommand::Audio(microphone_payload(100, 0.5)))
        .await
        .unwrap();
    h.wait_for(SessionEvent::Interrupted {
        source: InterruptSource::Local,
    })
    .await;

    h.script.push(RemoteEvent::Interrupted).await;
    h.listening().await;

    assert_eq!(h.interrupts_seen(), vec![InterruptSource::Local]);
    assert_eq!(h.script.interrupts_sent(), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_interrupt_clears_playback() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(5, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    h.script.push(RemoteEvent::Interrupted).await;
    let interrupted_at = h
        .wait_for(SessionEvent::Interrupted {
            source: InterruptSource::Remote,
        })
        .await;
    assert_eq!(h.sink.halted().len(), 5);

    let listening_at = h.listening().await;
    assert_eq!(listening_at - interrupted_at, Duration::from_millis(150));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_triggers_inside_retrigger_window_merge() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(10, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    let t0 = Instant::now();
    h.handle.send(SessionCommand::Interrupt).await.unwrap();
    sleep(Duration::from_millis(30)).await;
    h.handle.send(SessionCommand::Interrupt).await.unwrap();

    // Debounce keeps running from the first trigger
    let listening_at = h.listening().await;
    assert_eq!(listening_at - t0, Duration::from_millis(150));
    assert_eq!(h.interrupts_seen(), vec![InterruptSource::Client]);
    assert_eq!(h.script.interrupts_sent(), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_after_retrigger_window_restarts_debounce() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script.push_speech(10, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    let t0 = Instant::now();
    h.handle.send(SessionCommand::Interrupt).await.unwrap();
    sleep(Duration::from_millis(80)).await;
    h.handle.send(SessionCommand::Interrupt).await.unwrap();

    let listening_at = h.listening().await;
    assert_eq!(listening_at - t0, Duration::from_millis(230));
    assert_eq!(
        h.interrupts_seen(),
        vec![InterruptSource::Client, InterruptSource::Client]
    );
    assert_eq!(h.script.interrupts_sent(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ack_tone_plays_without_delaying_listening() {
    let mut config = SessionConfig::default();
    config.ack_tone = true;
    let mut h = start(config);
    h.listening().await;

    h.script.push_speech(5, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;
    h.handle.send(SessionCommand::Interrupt).await.unwrap();
    let interrupted_at = h
        .wait_for(SessionEvent::Interrupted {
            source: InterruptSource::Client,
        })
        .await;

    assert_eq!(h.sink.tones().len(), 1);
    let listening_at = h.listening().await;
    assert_eq!(listening_at - interrupted_at, Duration::from_millis(150));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_audio_is_dropped() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.script
        .push(RemoteEvent::Audio("not base64 at all!".to_string()))
        .await;
    h.handle
        .send(SessionCommand::Audio("%%%".to_string()))
        .await
        .unwrap();
    h.script.push_speech(1, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    assert_eq!(h.sink.speech().len(), 1);
    assert!(
        !h.seen
            .iter()
            .any(|(_, e)| matches!(e, SessionEvent::Error(_)))
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mute_stops_upstream_audio() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    h.handle.send(SessionCommand::Mute).await.unwrap();
    h.handle
        .send(SessionCommand::Audio(microphone_payload(200, 0.2)))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    let audio_sent = |script: &RemoteScript| {
        script
            .sent()
            .iter()
            .filter(|input| matches!(input, RemoteInput::Audio(_)))
            .count()
    };
    assert_eq!(audio_sent(&h.script), 0);

    h.handle.send(SessionCommand::Unmute).await.unwrap();
    h.handle
        .send(SessionCommand::Audio(microphone_payload(100, 0.2)))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(audio_sent(&h.script), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_releases_everything_once() {
    let mut h = start(SessionConfig::default());
    h.listening().await;
    h.script.push_speech(3, 100).await;
    h.wait_for(SessionEvent::Avatar(AvatarState::Speaking)).await;

    let script = h.script.clone();
    let handle = h.handle.clone();
    let rest = h.shutdown().await;

    assert_eq!(
        rest,
        vec![SessionEvent::Avatar(AvatarState::Idle), SessionEvent::Closed]
    );
    assert_eq!(script.close_count(), 1);
    assert!(handle.is_closed());
    assert!(handle.send(SessionCommand::Shutdown).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_ends_session() {
    let mut h = start(SessionConfig::default());
    h.listening().await;

    let Harness {
        handle,
        mut events,
        script,
        task,
        ..
    } = h;
    drop(handle);

    task.await.unwrap().unwrap();
    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert_eq!(last, Some(SessionEvent::Closed));
    assert_eq!(script.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_on_send_ends_session() {
    let (remote, script) = broken_remote();
    let mut h = start_with(SessionConfig::default(), remote, script);
    h.listening().await;

    h.handle
        .send(SessionCommand::Text("hello".to_string()))
        .await
        .unwrap();
    h.wait_for(SessionEvent::Closed).await;

    assert!(h.seen.iter().any(|(_, e)| matches!(
        e,
        SessionEvent::Error(notice) if notice.error_type == "connection_closed"
    )));
    h.task.await.unwrap().unwrap();
}
