//! Relay WebSocket handler
//!
//! Bridges one browser WebSocket to one [`Session`]: client frames become
//! session commands, session events become client frames. A connection
//! admitted with [`Auth::Pending`] must authenticate with its first message
//! before the session is created.

use axum::{
    Extension,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{Auth, AuthError, Authenticator};
use crate::core::remote::RemoteConnector;
use crate::middleware::{ClientIp, ConnectionGuard};
use crate::session::{ErrorNotice, Session, SessionCommand, SessionIo};
use crate::state::AppState;

use super::messages::{
    MAX_MESSAGE_SIZE, ProtocolViolation, RelayOutgoingMessage, parse_client_auth,
    parse_client_message, to_wire,
};

/// Decoded microphone blocks buffered ahead of the capture pipeline
const MICROPHONE_BUFFER_SIZE: usize = 64;

/// Out-of-band notices (protocol errors) waiting for the socket
const NOTICE_BUFFER_SIZE: usize = 16;

/// Violations tolerated before the connection is dropped
const MAX_PROTOCOL_VIOLATIONS: u32 = 10;

/// How long to wait for the session to finish its teardown
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a pending connection has to send its first (auth) message
const FIRST_MESSAGE_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

type SocketSender = SplitSink<WebSocket, Message>;
type SocketReceiver = SplitStream<WebSocket>;

/// Relay WebSocket handler
///
/// Upgrades the HTTP connection and runs one session for its lifetime.
/// Admission (origin, rate, connection slots) happens in
/// `connection_limit_middleware`, which hands over the reserved slot;
/// `auth_middleware` decides the [`Auth`] state.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Extension(guard): Extension<Arc<ConnectionGuard>>,
    Extension(auth): Extension<Auth>,
) -> Response {
    let Some(connector) = state.connector().cloned() else {
        warn!(ip = %client_ip.0, "Rejecting relay connection: model not configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Model API key not configured.",
        )
            .into_response();
    };

    info!(
        ip = %client_ip.0,
        uid = auth.uid().unwrap_or("-"),
        "Relay WebSocket connection upgrade requested"
    );

    ws.max_frame_size(MAX_MESSAGE_SIZE)
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| {
            handle_relay_socket(socket, state, connector, client_ip, guard, auth)
        })
}

/// Run one relay connection to completion.
async fn handle_relay_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    connector: Arc<dyn RemoteConnector>,
    client_ip: ClientIp,
    _guard: Arc<ConnectionGuard>,
    auth: Auth,
) {
    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, ip = %client_ip.0, "Relay WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();

    let mut first_command = None;
    if auth.is_pending()
        && let Some(authenticator) = state.authenticator()
    {
        match first_message_auth(&mut receiver, authenticator).await {
            Ok((uid, command)) => {
                info!(session_id = %session_id, uid = %uid, "First-message authentication successful");
                if let Ok(json) =
                    serde_json::to_string(&RelayOutgoingMessage::Authenticated { uid: &uid })
                    && sender.send(Message::Text(json.into())).await.is_err()
                {
                    return;
                }
                first_command = command;
            }
            Err(None) => {
                debug!(session_id = %session_id, "Connection closed before authenticating");
                return;
            }
            Err(Some(e)) => {
                warn!(session_id = %session_id, error = %e, "First-message authentication failed");
                reject_unauthenticated(&mut sender, &e).await;
                return;
            }
        }
    }

    let remote = match connector.create() {
        Ok(remote) => remote,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to create model channel");
            let notice = ErrorNotice::from(&e);
            if let Ok(json) = serde_json::to_string(&RelayOutgoingMessage::Error(&notice)) {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (session, handle, mut events) = Session::new(
        session_id.clone(),
        state.config.session.clone(),
        remote,
        SessionIo::client(MICROPHONE_BUFFER_SIZE),
    );
    state.sessions.register(handle.clone());

    let (notice_tx, mut notice_rx) = mpsc::channel::<ErrorNotice>(NOTICE_BUFFER_SIZE);

    // Sender task for outgoing messages
    let sender_task = tokio::spawn(async move {
        loop {
            let text = select! {
                biased;
                event = events.recv() => match event.as_ref().and_then(to_wire) {
                    Some(text) => text,
                    None => {
                        debug!("Session finished, closing socket");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(notice) = notice_rx.recv() => {
                    match serde_json::to_string(&RelayOutgoingMessage::Error(&notice)) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize error notice: {}", e);
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = sender.send(Message::Text(text.into())).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let session_task = tokio::spawn(session.run());

    if let Some(command) = first_command {
        let _ = handle.send(command).await;
    }

    let mut violations = 0u32;
    loop {
        select! {
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, "Relay WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!(session_id = %session_id, "Relay WebSocket closed by client");
                        break;
                    }
                };

                let parsed = match msg {
                    Message::Text(text) => parse_client_message(text.as_str()),
                    Message::Binary(_) => Err(ProtocolViolation::BinaryFrame),
                    Message::Close(_) => {
                        info!(session_id = %session_id, "Relay WebSocket close received");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                state.sessions.touch(&session_id);

                match parsed {
                    Ok(command) => {
                        if handle.send(command).await.is_err() {
                            debug!(session_id = %session_id, "Session no longer accepts commands");
                            break;
                        }
                    }
                    Err(ProtocolViolation::AlreadyAuthenticated) => {
                        debug!(session_id = %session_id, "Ignoring repeated auth message");
                    }
                    Err(violation) => {
                        violations += 1;
                        warn!(
                            session_id = %session_id,
                            violations,
                            "Dropping client message: {}",
                            violation
                        );
                        let _ = notice_tx.try_send(violation.notice());
                        if violations >= MAX_PROTOCOL_VIOLATIONS {
                            warn!(session_id = %session_id, "Too many protocol violations, closing");
                            break;
                        }
                    }
                }
            }
            _ = handle.closed() => {
                debug!(session_id = %session_id, "Session ended");
                break;
            }
        }
    }

    // Cleanup
    let _ = handle.try_send(SessionCommand::Shutdown);
    match timeout(SESSION_SHUTDOWN_TIMEOUT, session_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(session_id = %session_id, error = %e, "Session failed"),
        Ok(Err(e)) => error!(session_id = %session_id, "Session task panicked: {}", e),
        Err(_) => warn!(session_id = %session_id, "Session teardown timed out"),
    }
    state.sessions.remove(&session_id);

    if timeout(SESSION_SHUTDOWN_TIMEOUT, sender_task).await.is_err() {
        debug!(session_id = %session_id, "Sender task did not finish in time");
    }

    info!(session_id = %session_id, "Relay WebSocket connection terminated");
}

/// Wait for the first client frame and authenticate with the token it
/// carries.
///
/// Returns the verified uid and, when the frame was an ordinary message
/// with an `auth_token` field, the command it holds. `Err(None)` means the
/// client went away first.
async fn first_message_auth(
    receiver: &mut SocketReceiver,
    authenticator: &Authenticator,
) -> Result<(String, Option<SessionCommand>), Option<AuthError>> {
    let first = timeout(FIRST_MESSAGE_AUTH_TIMEOUT, async {
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Some(text)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => return Some(None),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            }
        }
    })
    .await;

    let text = match first {
        Ok(Some(Some(text))) => text,
        Ok(Some(None)) => return Err(Some(AuthError::MissingToken)),
        Ok(None) => return Err(None),
        Err(_) => {
            debug!("No auth message before the deadline");
            return Err(Some(AuthError::MissingToken));
        }
    };

    let presented = parse_client_auth(text.as_str()).ok_or(AuthError::MissingToken)?;
    let claims = authenticator.authenticate(&presented.token).await?;

    let command = if presented.standalone {
        None
    } else {
        match parse_client_message(text.as_str()) {
            Ok(command) => Some(command),
            Err(violation) => {
                debug!("Authenticated first message not usable: {}", violation);
                None
            }
        }
    };
    Ok((claims.uid, command))
}

/// Tell the client why it is being dropped, then close with a policy
/// violation.
async fn reject_unauthenticated(sender: &mut SocketSender, error: &AuthError) {
    let notice = error.notice();
    if let Ok(json) = serde_json::to_string(&RelayOutgoingMessage::Error(&notice)) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "Authentication required".into(),
        })))
        .await;
}
