//! Gemini Live API client implementation.
//!
//! # API Reference
//!
//! - Endpoint: `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=<key>`
//! - Protocol: WebSocket with JSON messages (text or binary frames)
//! - Audio in: PCM 16-bit, 16kHz, mono, little-endian, base64 encoded
//! - Audio out: PCM 16-bit, 24kHz, mono, little-endian, base64 encoded

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::config::{GeminiConfig, mask_api_key};
use super::messages::{ClientContent, ClientMessage, ServerMessage, Setup, encode_input};
use crate::core::remote::base::{
    BoxedRemote, RemoteChannel, RemoteConnector, RemoteError, RemoteEvent, RemoteInput,
    RemoteResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Grace period for the connection task to flush a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Item on the outbound queue of the connection task.
#[derive(Debug)]
enum Outbound {
    Json(String),
    /// Drop the rest of the model turn in progress
    Interrupt,
}

/// Result of decoding one WebSocket frame.
enum Frame {
    Server(ServerMessage),
    /// Reply owed to a ping
    Pong(Message),
    Close(Option<String>),
    Ignore,
}

fn decode_frame(msg: Message) -> Frame {
    let text = match &msg {
        Message::Text(text) => text.as_str(),
        Message::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                warn!(len = data.len(), "Ignoring non UTF-8 binary frame");
                return Frame::Ignore;
            }
        },
        Message::Ping(data) => return Frame::Pong(Message::Pong(data.clone())),
        Message::Close(frame) => {
            return Frame::Close(
                frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty()),
            );
        }
        _ => return Frame::Ignore,
    };

    match ServerMessage::parse(text) {
        Ok(message) => Frame::Server(message),
        Err(e) => {
            warn!("Failed to parse server message: {}", e);
            Frame::Ignore
        }
    }
}

/// Error reported when the server closes the socket.
fn close_error(reason: Option<String>) -> RemoteError {
    match reason {
        Some(reason) => match RemoteError::classify(reason.clone()) {
            RemoteError::General(_) => RemoteError::ConnectionClosed(reason),
            classified => classified,
        },
        None => RemoteError::ConnectionClosed("closed by server".to_string()),
    }
}

// =============================================================================
// Gemini Live Client
// =============================================================================

/// Gemini Live client implementing [`RemoteChannel`].
///
/// All socket I/O happens on a spawned connection task; [`send`](RemoteChannel::send)
/// only enqueues onto a bounded channel with a per-kind deadline.
pub struct GeminiLive {
    config: GeminiConfig,
    ready: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
    sender: Option<mpsc::Sender<Outbound>>,
    connection_handle: Option<JoinHandle<()>>,
}

impl GeminiLive {
    pub fn new(config: GeminiConfig) -> RemoteResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ready: Arc::new(AtomicBool::new(false)),
            intentional_close: Arc::new(AtomicBool::new(false)),
            sender: None,
            connection_handle: None,
        })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    async fn open_socket(&self) -> RemoteResult<WsStream> {
        let url = self.config.ws_url()?;
        let host = url
            .host_str()
            .ok_or_else(|| RemoteError::InvalidConfiguration("url has no host".to_string()))?
            .to_string();

        let request = http::Request::builder()
            .uri(url.as_str())
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| RemoteError::ConnectionFailed(e.to_string()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match RemoteError::classify(e.to_string()) {
                RemoteError::General(message) => RemoteError::ConnectionFailed(message),
                classified => classified,
            })?;

        Ok(ws_stream)
    }

    /// Open the socket, retrying with backoff.
    async fn open_with_retry(&self) -> RemoteResult<WsStream> {
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            info!(
                attempt,
                max_attempts = retry.max_attempts,
                "Connecting to Gemini Live"
            );

            match self.open_socket().await {
                Ok(stream) => return Ok(stream),
                Err(e) if retry.should_retry(attempt) && !matches!(e, RemoteError::InvalidConfiguration(_)) => {
                    let delay = retry.calculate_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Connection attempt failed: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(attempt, "Giving up connecting to Gemini Live: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

/// Wait for `setupComplete`. Returns `Ok(false)` when the deadline passes.
async fn await_setup<S>(stream: &mut S, timeout: Duration) -> RemoteResult<bool>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let wait = async {
        while let Some(msg) = stream.next().await {
            let msg = msg.map_err(|e| RemoteError::classify(e.to_string()))?;
            match decode_frame(msg) {
                Frame::Server(message) => {
                    if message
                        .into_events()
                        .iter()
                        .any(|e| matches!(e, RemoteEvent::SetupComplete))
                    {
                        return Ok(());
                    }
                }
                Frame::Close(reason) => return Err(close_error(reason)),
                Frame::Pong(_) | Frame::Ignore => {}
            }
        }
        Err(RemoteError::ConnectionClosed(
            "stream ended during setup".to_string(),
        ))
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(())) => Ok(true),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(false),
    }
}

/// Send the preload turn and consume the model's acknowledgment.
async fn preload_context<S>(ws: &mut S, text: &str, timeout: Duration) -> RemoteResult<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let json = ClientMessage::ClientContent(ClientContent::user_text(text)).to_json()?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| RemoteError::classify(e.to_string()))?;

    let wait = async {
        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| RemoteError::classify(e.to_string()))?;
            match decode_frame(msg) {
                Frame::Server(message) => {
                    if message
                        .into_events()
                        .iter()
                        .any(|e| matches!(e, RemoteEvent::TurnComplete | RemoteEvent::Interrupted))
                    {
                        return Ok(());
                    }
                }
                Frame::Close(reason) => return Err(close_error(reason)),
                Frame::Pong(reply) => {
                    ws.send(reply)
                        .await
                        .map_err(|e| RemoteError::classify(e.to_string()))?;
                }
                Frame::Ignore => {}
            }
        }
        Err(RemoteError::ConnectionClosed(
            "stream ended during preload".to_string(),
        ))
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| RemoteError::Timeout("context preload acknowledgment".to_string()))?
}

/// Tracks whether the model turn in progress should be dropped.
#[derive(Debug, Default)]
struct TurnFilter {
    turn_active: bool,
    suppressing: bool,
}

impl TurnFilter {
    fn interrupt(&mut self) {
        if self.turn_active {
            self.suppressing = true;
        }
    }

    /// Returns `None` for events belonging to a suppressed turn.
    fn filter(&mut self, event: RemoteEvent) -> Option<RemoteEvent> {
        match event {
            RemoteEvent::Audio(_) | RemoteEvent::Text(_) => {
                self.turn_active = true;
                (!self.suppressing).then_some(event)
            }
            RemoteEvent::TurnComplete => {
                self.turn_active = false;
                if std::mem::take(&mut self.suppressing) {
                    None
                } else {
                    Some(event)
                }
            }
            RemoteEvent::Interrupted => {
                self.turn_active = false;
                self.suppressing = false;
                Some(event)
            }
            other => Some(other),
        }
    }
}

async fn run_connection(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<RemoteEvent>,
    ready: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
) {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut filter = TurnFilter::default();
    let mut failure: Option<RemoteError> = None;

    loop {
        tokio::select! {
            item = outbound.recv() => {
                match item {
                    Some(Outbound::Json(json)) => {
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            error!("Failed to send WebSocket message: {}", e);
                            failure = Some(RemoteError::classify(e.to_string()));
                            break;
                        }
                    }
                    Some(Outbound::Interrupt) => filter.interrupt(),
                    None => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg = ws_stream.next() => {
                let Some(msg) = msg else {
                    failure = Some(RemoteError::ConnectionClosed("stream ended".to_string()));
                    break;
                };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        failure = Some(RemoteError::classify(e.to_string()));
                        break;
                    }
                };

                match decode_frame(msg) {
                    Frame::Server(message) => {
                        for event in message.into_events() {
                            if let RemoteEvent::Usage { total_tokens } = event {
                                debug!(total_tokens, "Usage metadata");
                            }
                            if let Some(event) = filter.filter(event)
                                && events.send(event).await.is_err()
                            {
                                debug!("Event receiver dropped, closing connection");
                                let _ = ws_sink.send(Message::Close(None)).await;
                                ready.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                    Frame::Pong(reply) => {
                        if let Err(e) = ws_sink.send(reply).await {
                            warn!("Failed to send pong: {}", e);
                        }
                    }
                    Frame::Close(reason) => {
                        info!(reason = ?reason, "WebSocket closed by server");
                        failure = Some(close_error(reason));
                        break;
                    }
                    Frame::Ignore => {}
                }
            }
        }
    }

    ready.store(false, Ordering::SeqCst);

    if !intentional_close.load(Ordering::SeqCst)
        && let Some(err) = failure
    {
        let _ = events.send(RemoteEvent::Error(err)).await;
    }
    let _ = events.send(RemoteEvent::Closed).await;
}

#[async_trait]
impl RemoteChannel for GeminiLive {
    async fn connect(&mut self) -> RemoteResult<mpsc::Receiver<RemoteEvent>> {
        if self.sender.is_some() {
            return Err(RemoteError::General("already connected".to_string()));
        }
        self.intentional_close.store(false, Ordering::SeqCst);

        info!(
            model = %self.config.model_path(),
            voice = %self.config.voice,
            api_key = %mask_api_key(&self.config.api_key),
            "Opening Gemini Live session"
        );

        let mut ws_stream = self.open_with_retry().await?;

        let setup = ClientMessage::Setup(Setup::from_config(&self.config)).to_json()?;
        ws_stream
            .send(Message::Text(setup.into()))
            .await
            .map_err(|e| RemoteError::classify(e.to_string()))?;

        let acknowledged = await_setup(&mut ws_stream, self.config.setup_timeout).await?;
        if acknowledged {
            info!("Setup complete acknowledged");
        } else {
            warn!(
                timeout_ms = self.config.setup_timeout.as_millis() as u64,
                "Setup complete timeout, proceeding anyway"
            );
        }

        if let Some(text) = self.config.preload_context.clone()
            && !text.trim().is_empty()
        {
            info!(chars = text.len(), "Preloading context");
            match preload_context(&mut ws_stream, &text, self.config.preload_timeout).await {
                Ok(()) => info!("Context preload complete"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Failed to preload context: {}", e),
            }
        }

        let (tx, rx) = mpsc::channel::<Outbound>(self.config.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel::<RemoteEvent>(self.config.channel_capacity);

        if acknowledged {
            let _ = events_tx.send(RemoteEvent::SetupComplete).await;
        }

        self.ready.store(true, Ordering::SeqCst);
        self.sender = Some(tx);
        self.connection_handle = Some(tokio::spawn(run_connection(
            ws_stream,
            rx,
            events_tx,
            self.ready.clone(),
            self.intentional_close.clone(),
        )));

        Ok(events_rx)
    }

    async fn send(&self, input: RemoteInput) -> RemoteResult<()> {
        let sender = self.sender.as_ref().ok_or(RemoteError::NotConnected)?;
        let timeout = self.config.send_timeouts.for_input(&input);
        let kind = input.kind();

        let item = match encode_input(&input)? {
            Some(json) => Outbound::Json(json),
            None => Outbound::Interrupt,
        };

        sender
            .send_timeout(item, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    RemoteError::Timeout(format!("sending {kind} to the model"))
                }
                SendTimeoutError::Closed(_) => {
                    RemoteError::ConnectionClosed("connection task ended".to_string())
                }
            })
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.intentional_close.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.sender = None;

        if let Some(handle) = self.connection_handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                warn!("Connection task did not finish in time, aborting");
                abort.abort();
            }
            info!("Gemini Live session closed");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "gemini",
            "model": self.config.model_path(),
            "voice": self.config.voice.as_str(),
            "affective_dialog": self.config.affective_dialog,
            "input_sample_rate": crate::core::remote::base::INPUT_SAMPLE_RATE,
            "output_sample_rate": crate::core::remote::base::OUTPUT_SAMPLE_RATE,
        })
    }
}

impl Drop for GeminiLive {
    fn drop(&mut self) {
        if let Some(handle) = self.connection_handle.take() {
            handle.abort();
        }
    }
}

/// Builds a [`GeminiLive`] channel per session from shared settings.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    config: GeminiConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }
}

impl RemoteConnector for GeminiConnector {
    fn create(&self) -> RemoteResult<BoxedRemote> {
        Ok(Box::new(GeminiLive::new(self.config.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_new_rejects_missing_key() {
        assert!(matches!(
            GeminiLive::new(GeminiConfig::new("")),
            Err(RemoteError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = GeminiLive::new(GeminiConfig::new("AIza-test")).unwrap();
        assert!(!client.is_ready());
        assert_eq!(
            client.send(RemoteInput::EndOfTurn).await,
            Err(RemoteError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_close_without_connect_is_ok() {
        let mut client = GeminiLive::new(GeminiConfig::new("AIza-test")).unwrap();
        assert!(client.close().await.is_ok());
        assert!(client.close().await.is_ok());
    }

    #[test]
    fn test_provider_info() {
        let client = GeminiLive::new(GeminiConfig::new("AIza-test")).unwrap();
        let info = client.provider_info();
        assert_eq!(info["provider"], "gemini");
        assert_eq!(info["voice"], "Puck");
        assert_eq!(info["output_sample_rate"], 24000);
    }

    #[test]
    fn test_turn_filter_suppresses_interrupted_turn() {
        let mut filter = TurnFilter::default();

        assert!(filter.filter(RemoteEvent::Audio("a".into())).is_some());
        filter.interrupt();
        assert!(filter.filter(RemoteEvent::Audio("b".into())).is_none());
        assert!(filter.filter(RemoteEvent::Text("t".into())).is_none());
        assert!(filter.filter(RemoteEvent::TurnComplete).is_none());

        // Next turn flows again
        assert!(filter.filter(RemoteEvent::Audio("c".into())).is_some());
        assert_eq!(
            filter.filter(RemoteEvent::TurnComplete),
            Some(RemoteEvent::TurnComplete)
        );
    }

    #[test]
    fn test_turn_filter_ignores_interrupt_between_turns() {
        let mut filter = TurnFilter::default();
        filter.filter(RemoteEvent::Audio("a".into()));
        filter.filter(RemoteEvent::TurnComplete);

        filter.interrupt();
        assert!(filter.filter(RemoteEvent::Audio("next".into())).is_some());
    }

    #[test]
    fn test_turn_filter_interrupted_clears_suppression() {
        let mut filter = TurnFilter::default();
        filter.filter(RemoteEvent::Audio("a".into()));
        filter.interrupt();
        assert_eq!(
            filter.filter(RemoteEvent::Interrupted),
            Some(RemoteEvent::Interrupted)
        );
        assert!(filter.filter(RemoteEvent::Audio("b".into())).is_some());
    }

    #[test]
    fn test_decode_text_and_binary_frames() {
        let json = r#"{"setupComplete":{}}"#;
        assert!(matches!(
            decode_frame(Message::Text(json.to_string().into())),
            Frame::Server(_)
        ));
        assert!(matches!(
            decode_frame(Message::Binary(json.as_bytes().to_vec().into())),
            Frame::Server(_)
        ));
        assert!(matches!(
            decode_frame(Message::Binary(vec![0xff, 0xfe].into())),
            Frame::Ignore
        ));
    }

    #[test]
    fn test_close_reason_classification() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "Resource has been exhausted (e.g. check quota)."
                .to_string()
                .into(),
        };
        let Frame::Close(reason) = decode_frame(Message::Close(Some(frame))) else {
            panic!("expected close");
        };
        assert!(matches!(close_error(reason), RemoteError::QuotaExceeded(_)));

        assert!(matches!(
            close_error(Some("Internal error".into())),
            RemoteError::ConnectionClosed(_)
        ));
        assert!(matches!(close_error(None), RemoteError::ConnectionClosed(_)));
    }
}
