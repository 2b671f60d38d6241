use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::events::{ErrorNotice, InterruptSource, SessionCommand, SessionEvent};
use super::sink::EventSink;
use super::state::{AvatarState, InterruptState, Lifecycle};
use super::{SessionConfig, SessionError, SessionResult};
use crate::core::capture::{
    CaptureError, CaptureEvent, CaptureFrame, CapturePipeline, CaptureSource, CaptureStreams,
    ClientCaptureSource, ClientMicrophone,
};
use crate::core::codec;
use crate::core::playback::{AudioClock, MonotonicClock, PlaybackEvent, PlaybackScheduler, PlaybackSink};
use crate::core::remote::{
    BoxedRemote, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, RemoteError, RemoteEvent, RemoteInput,
};

/// Bound on how long teardown waits to hand the final event to the client.
const CLOSE_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Audio endpoints of a session.
pub struct SessionIo {
    /// Microphone input for the capture pipeline
    pub capture: Box<dyn CaptureSource>,
    /// Feeding side of `capture` when client audio drives it
    pub microphone: Option<ClientMicrophone>,
    /// Playback output. `None` forwards scheduled audio to the client as events.
    pub sink: Option<Arc<dyn PlaybackSink>>,
    pub clock: Arc<dyn AudioClock>,
}

impl SessionIo {
    /// Relay wiring: client audio in, scheduled audio back out as events.
    pub fn client(capacity: usize) -> Self {
        let (microphone, source) = ClientCaptureSource::new(capacity);
        Self {
            capture: Box::new(source),
            microphone: Some(microphone),
            sink: None,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

/// Client side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::Sender<SessionCommand>,
    avatar: watch::Receiver<AvatarState>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a command, waiting for capacity.
    pub async fn send(&self, command: SessionCommand) -> SessionResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue a command without waiting.
    pub fn try_send(&self, command: SessionCommand) -> SessionResult<()> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(cmd) => {
                warn!(session_id = %self.id, kind = cmd.kind(), "Session command queue full");
                SessionError::Closed
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Subscribe to avatar state changes.
    pub fn avatar(&self) -> watch::Receiver<AvatarState> {
        self.avatar.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the session has stopped accepting commands.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

/// One client conversation with the remote model.
///
/// Created with [`Session::new`] and driven to completion by
/// [`Session::run`]. All state changes happen on the task running `run`,
/// one message at a time.
pub struct Session {
    id: String,
    config: SessionConfig,
    remote: BoxedRemote,
    capture_source: Option<Box<dyn CaptureSource>>,
    microphone: Option<ClientMicrophone>,
    clock: Arc<dyn AudioClock>,
    scheduler: PlaybackScheduler,
    capture: Option<CapturePipeline>,
    commands: mpsc::Receiver<SessionCommand>,
    events: Option<mpsc::Sender<SessionEvent>>,
    avatar: watch::Sender<AvatarState>,
    lifecycle: Lifecycle,
    interrupt: InterruptState,
    debounce_deadline: Option<Instant>,
    /// Turn completed while audio was still playing; listen once drained
    pending_turn_complete: bool,
    torn_down: bool,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        remote: BoxedRemote,
        io: SessionIo,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionEvent>) {
        let id = id.into();
        let capacity = config.channel_capacity.max(1);
        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (avatar_tx, avatar_rx) = watch::channel(AvatarState::Idle);

        let sink: Arc<dyn PlaybackSink> = match io.sink {
            Some(sink) => sink,
            None => Arc::new(EventSink::new(events_tx.clone())),
        };
        let scheduler = PlaybackScheduler::new(io.clock.clone(), sink);

        let session = Self {
            id: id.clone(),
            config,
            remote,
            capture_source: Some(io.capture),
            microphone: io.microphone,
            clock: io.clock,
            scheduler,
            capture: None,
            commands: commands_rx,
            events: Some(events_tx),
            avatar: avatar_tx,
            lifecycle: Lifecycle::Connecting,
            interrupt: InterruptState::default(),
            debounce_deadline: None,
            pending_turn_complete: false,
            torn_down: false,
        };
        let handle = SessionHandle {
            id,
            commands: commands_tx,
            avatar: avatar_rx,
        };
        (session, handle, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Subscribe to avatar state changes.
    pub fn avatar(&self) -> watch::Receiver<AvatarState> {
        self.avatar.subscribe()
    }

    /// Connect, then process commands and model events until the session ends.
    ///
    /// Returns an error only when the session could not be established.
    pub async fn run(mut self) -> SessionResult<()> {
        let mut remote_events = match self.remote.connect().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Remote connection failed");
                self.emit(SessionEvent::Error(ErrorNotice::from(&e)));
                self.teardown().await;
                return Err(e.into());
            }
        };

        self.lifecycle = Lifecycle::Ready;
        self.emit(SessionEvent::Ready);
        info!(session_id = %self.id, "Session ready");

        let streams = match self.start_capture() {
            Ok(streams) => streams,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Capture start failed");
                self.emit(SessionEvent::Error(
                    ErrorNotice::new("device_unavailable", e.to_string())
                        .with_action("Please check your microphone and try again."),
                ));
                self.teardown().await;
                return Err(e.into());
            }
        };
        let CaptureStreams {
            frames,
            events: capture_events,
        } = streams;
        let mut frames = Some(frames);
        let mut capture_events = Some(capture_events);

        self.lifecycle = Lifecycle::Active;
        self.set_avatar(AvatarState::Listening);

        loop {
            let debounce_at = self.debounce_deadline.unwrap_or_else(far_future);
            let drain_at = self.drain_deadline();

            let keep_going = select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!(session_id = %self.id, "Command channel closed");
                        false
                    }
                },
                event = remote_events.recv() => match event {
                    Some(event) => self.handle_remote_event(event).await,
                    None => {
                        debug!(session_id = %self.id, "Remote event stream ended");
                        false
                    }
                },
                frame = recv_opt(&mut frames), if frames.is_some() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => {
                        frames = None;
                        true
                    }
                },
                event = recv_opt(&mut capture_events), if capture_events.is_some() => match event {
                    Some(event) => self.handle_capture_event(event).await,
                    None => {
                        capture_events = None;
                        true
                    }
                },
                _ = sleep_until(debounce_at), if self.debounce_deadline.is_some() => {
                    self.on_debounce_expired();
                    true
                },
                _ = sleep_until(drain_at.unwrap_or_else(far_future)), if drain_at.is_some() => {
                    self.on_drain_deadline();
                    true
                },
            };

            if !keep_going {
                break;
            }
        }

        self.teardown().await;
        Ok(())
    }

    fn start_capture(&mut self) -> SessionResult<CaptureStreams> {
        let source = self.capture_source.take().ok_or_else(|| {
            CaptureError::DeviceUnavailable("capture source already consumed".to_string())
        })?;
        let (pipeline, streams) = CapturePipeline::start(self.config.capture_config(), source)?;
        self.capture = Some(pipeline);
        Ok(streams)
    }

    // =========================================================================
    // Client commands
    // =========================================================================

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Audio(payload) => {
                self.feed_microphone(&payload);
                true
            }
            SessionCommand::Text(text) => self.forward(RemoteInput::Text(text)).await,
            SessionCommand::Image { data, mime_type } => {
                self.forward(RemoteInput::Image { data, mime_type }).await
            }
            SessionCommand::EndOfTurn => self.forward(RemoteInput::EndOfTurn).await,
            SessionCommand::ToolResponse(value) => {
                self.forward(RemoteInput::ToolResponse(value)).await
            }
            SessionCommand::Interrupt => self.interrupt(InterruptSource::Client).await,
            SessionCommand::Mute => {
                if let Some(capture) = &self.capture {
                    capture.mute();
                }
                true
            }
            SessionCommand::Unmute => {
                if let Some(capture) = &self.capture {
                    capture.unmute();
                }
                true
            }
            SessionCommand::Shutdown => {
                info!(session_id = %self.id, "Session shutdown requested");
                false
            }
        }
    }

    fn feed_microphone(&self, payload: &str) {
        if self.capture.as_ref().is_some_and(|c| c.is_muted()) {
            return;
        }
        let Some(microphone) = &self.microphone else {
            debug!(session_id = %self.id, "No client microphone, dropping audio");
            return;
        };

        match codec::decode(payload, INPUT_SAMPLE_RATE) {
            Ok(chunk) => {
                microphone.push(chunk.samples().to_vec());
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Dropping malformed client audio");
            }
        }
    }

    async fn handle_frame(&mut self, frame: CaptureFrame) -> bool {
        self.forward(RemoteInput::Audio(frame.payload)).await
    }

    /// Send `input` upstream. Returns `false` when the failure ends the session.
    async fn forward(&mut self, input: RemoteInput) -> bool {
        let kind = input.kind();
        let realtime = input.is_realtime();
        let Err(e) = self.remote.send(input).await else {
            return true;
        };

        if e.is_fatal() {
            warn!(session_id = %self.id, kind, error = %e, "Remote send failed, ending session");
            self.emit(SessionEvent::Error(ErrorNotice::from(&e)));
            return false;
        }
        if realtime {
            warn!(session_id = %self.id, kind, error = %e, "Dropping realtime input");
        } else {
            warn!(session_id = %self.id, kind, error = %e, "Remote send failed");
            self.emit(SessionEvent::Error(ErrorNotice::from(&e)));
        }
        true
    }

    // =========================================================================
    // Remote events
    // =========================================================================

    async fn handle_remote_event(&mut self, event: RemoteEvent) -> bool {
        match event {
            RemoteEvent::SetupComplete => {
                self.emit(SessionEvent::SetupComplete);
                true
            }
            RemoteEvent::Audio(payload) => {
                self.on_remote_audio(&payload);
                true
            }
            RemoteEvent::Text(text) => {
                self.emit(SessionEvent::Text(text));
                true
            }
            RemoteEvent::TurnComplete => {
                self.on_turn_complete();
                true
            }
            RemoteEvent::Interrupted => {
                if self.interrupt.is_active() {
                    debug!(session_id = %self.id, "Remote interrupt ignored, local interrupt in effect");
                    return true;
                }
                self.interrupt(InterruptSource::Remote).await
            }
            RemoteEvent::ToolCall(value) => {
                self.emit(SessionEvent::ToolCall(value));
                true
            }
            RemoteEvent::Usage { total_tokens } => {
                debug!(session_id = %self.id, total_tokens, "Usage update");
                true
            }
            RemoteEvent::GoAway { time_left } => {
                info!(session_id = %self.id, time_left = ?time_left, "Remote is going away");
                self.emit(SessionEvent::GoAway { time_left });
                false
            }
            RemoteEvent::Error(e) => self.on_remote_error(e),
            RemoteEvent::Closed => {
                info!(session_id = %self.id, "Remote channel closed");
                false
            }
        }
    }

    fn on_remote_audio(&mut self, payload: &str) {
        if self.interrupt.is_active() {
            debug!(session_id = %self.id, "Discarding model audio during interrupt");
            return;
        }

        let chunk = match codec::decode(payload, OUTPUT_SAMPLE_RATE) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Dropping malformed model audio");
                return;
            }
        };

        if self.scheduler.enqueue_and_schedule(chunk).is_none() {
            return;
        }
        self.set_avatar(AvatarState::Speaking);
        if let Some(capture) = &self.capture
            && !capture.is_armed()
        {
            capture.arm();
        }
    }

    fn on_turn_complete(&mut self) {
        self.emit(SessionEvent::TurnComplete);
        if self.interrupt.is_active() {
            return;
        }
        if self.scheduler.has_active() {
            self.pending_turn_complete = true;
        } else {
            self.resume_listening();
        }
    }

    fn on_remote_error(&mut self, error: RemoteError) -> bool {
        warn!(
            session_id = %self.id,
            category = error.category().as_str(),
            error = %error,
            "Remote error"
        );
        self.emit(SessionEvent::Error(ErrorNotice::from(&error)));
        !error.is_fatal()
    }

    // =========================================================================
    // Barge-in
    // =========================================================================

    async fn handle_capture_event(&mut self, event: CaptureEvent) -> bool {
        match event {
            CaptureEvent::InterruptDetected { rms } => {
                if !self.scheduler.has_active() {
                    debug!(session_id = %self.id, rms, "Energy spike with nothing playing, ignored");
                    return true;
                }
                info!(session_id = %self.id, rms, "Local barge-in detected");
                self.interrupt(InterruptSource::Local).await
            }
        }
    }

    /// Run the interrupt procedure, or merge into the previous trigger when
    /// it falls inside the re-trigger window.
    async fn interrupt(&mut self, source: InterruptSource) -> bool {
        let now = Instant::now();
        if self.interrupt.merges(now, self.config.retrigger_window()) {
            debug!(session_id = %self.id, %source, "Interrupt merged into previous trigger");
            return true;
        }

        self.debounce_deadline = None;
        self.interrupt.set(now);

        // Playback halts before the model is told, never after
        if let Some(capture) = &self.capture {
            capture.disarm();
        }
        self.scheduler.stop();
        if let Some(tone) = self.config.ack_tone_spec() {
            self.scheduler.play_tone(&tone);
        }
        self.pending_turn_complete = false;
        self.set_avatar(AvatarState::Idle);
        self.lifecycle = Lifecycle::Interrupted;
        self.debounce_deadline = Some(now + self.config.debounce_window());

        info!(session_id = %self.id, %source, "Playback interrupted");
        self.emit(SessionEvent::Interrupted { source });

        self.forward(RemoteInput::Interrupt).await
    }

    fn on_debounce_expired(&mut self) {
        self.debounce_deadline = None;
        self.interrupt.clear();
        self.lifecycle = Lifecycle::Active;
        self.set_avatar(AvatarState::Listening);
        if let Some(capture) = &self.capture {
            capture.arm();
        }
        debug!(session_id = %self.id, "Debounce elapsed, listening");
    }

    // =========================================================================
    // Playback drain
    // =========================================================================

    /// Runtime instant at which the scheduler's timeline ends.
    fn drain_deadline(&self) -> Option<Instant> {
        let deadline = self.scheduler.next_deadline()?;
        let remaining = deadline.saturating_sub(self.clock.now());
        Some(Instant::now() + remaining)
    }

    fn on_drain_deadline(&mut self) {
        if let Some(PlaybackEvent::Drained) = self.scheduler.poll() {
            debug!(session_id = %self.id, "Playback drained");
            if self.pending_turn_complete {
                self.resume_listening();
            }
        }
    }

    fn resume_listening(&mut self) {
        self.pending_turn_complete = false;
        self.set_avatar(AvatarState::Listening);
        if let Some(capture) = &self.capture {
            capture.disarm();
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    fn set_avatar(&self, state: AvatarState) {
        let changed = self.avatar.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(session_id = %self.id, avatar = %state, "Avatar state changed");
            self.emit(SessionEvent::Avatar(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let Some(events) = &self.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "Client event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Release everything the session holds. Safe to call more than once;
    /// each step runs regardless of the others.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.lifecycle = Lifecycle::Closing;

        self.debounce_deadline = None;
        self.interrupt.clear();

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut source) = self.capture_source.take() {
            source.close();
        }
        self.microphone = None;

        self.scheduler.stop();

        if let Err(e) = self.remote.close().await {
            warn!(session_id = %self.id, error = %e, "Remote close failed");
        }

        self.set_avatar(AvatarState::Idle);
        if let Some(events) = self.events.take()
            && events
                .send_timeout(SessionEvent::Closed, CLOSE_EVENT_TIMEOUT)
                .await
                .is_err()
        {
            debug!(session_id = %self.id, "Client gone before close event");
        }

        self.lifecycle = Lifecycle::Closed;
        info!(session_id = %self.id, "Session closed");
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
