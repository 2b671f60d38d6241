pub mod api;
pub mod relay;

use axum::Router;
use std::sync::Arc;

use crate::state::AppState;

/// Assemble every route with its state attached.
///
/// Server-wide layers (CORS, rate limiting, security headers) are added by
/// the binary.
pub fn create_router(state: Arc<AppState>) -> Router {
    api::create_api_router()
        .merge(relay::create_relay_router(state.clone()))
        .with_state(state)
}
