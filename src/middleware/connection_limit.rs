//! Admission middleware for WebSocket upgrades
//!
//! Applied in front of the relay route. For each upgrade request it:
//! - checks the `Origin` header against the allowed list (403)
//! - enforces the per-IP attempt rate over a sliding minute (429)
//! - reserves a global and per-IP connection slot (503 / 429)
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use avatar_relay::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/ws", get(relay_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header::ORIGIN},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Extension type carrying the client IP through to the handler.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Releases a reserved connection slot when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    state: Arc<AppState>,
    ip: IpAddr,
}

impl ConnectionGuard {
    pub fn new(state: Arc<AppState>, ip: IpAddr) -> Self {
        Self { state, ip }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.release_connection(self.ip);
    }
}

/// Middleware that enforces origin and connection limits on WebSocket upgrades.
///
/// Non-WebSocket requests pass through without checks. On success the
/// `ClientIp` and `Arc<ConnectionGuard>` extensions are injected; the slot is
/// released when the last guard clone is dropped.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    let origin = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
    if !state.is_origin_permitted(origin) {
        tracing::warn!(
            ip = %client_ip,
            origin = ?origin,
            "Rejecting connection: origin not allowed"
        );
        return (StatusCode::FORBIDDEN, "Origin not allowed.").into_response();
    }

    if state.check_connection_rate(client_ip).is_err() {
        tracing::warn!(ip = %client_ip, "Rejecting connection: rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many connection attempts. Please wait and try again.",
        )
            .into_response();
    }

    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            let guard = Arc::new(ConnectionGuard::new(state.clone(), client_ip));
            request.extensions_mut().insert(ClientIp(client_ip));
            request.extensions_mut().insert(guard);
            next.run(request).await
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(
                ip = %client_ip,
                "Rejecting connection: global limit reached"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached | ConnectionLimitError::RateLimited) => {
            tracing::warn!(
                ip = %client_ip,
                "Rejecting connection: per-IP limit reached"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}
