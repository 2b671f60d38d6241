//! Relay WebSocket route configuration

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::relay::relay_handler;
use crate::middleware::{auth_middleware, connection_limit_middleware};
use crate::state::AppState;
use std::sync::Arc;

/// Create the relay WebSocket router
///
/// # Endpoint
///
/// `GET /ws` - WebSocket upgrade for one duplex audio session
///
/// Admission (origin allow-list, per-IP attempt rate, connection slots) and
/// then authentication run as route middleware before the upgrade. With
/// `REQUIRE_AUTH` a token may come on the upgrade (`?token=` or a Bearer
/// header) or in the first message.
///
/// # Example
///
/// ```json
/// // Server, once the model is connected
/// {"ready": true}
///
/// // Client streams microphone audio
/// {"type": "audio", "data": "AAAB..."}
///
/// // Server streams speech and avatar hints back
/// {"type": "avatar_state", "data": "speaking"}
/// {"type": "audio", "data": "AAAB..."}
/// ```
pub fn create_relay_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(relay_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(
            state,
            connection_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}
