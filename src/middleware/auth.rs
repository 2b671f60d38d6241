use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::{Auth, AuthError, extract_token};
use crate::state::AppState;

/// Authentication middleware for relay upgrades
///
/// With authentication disabled an [`Auth::Disabled`] context is inserted and
/// the request passes through. Otherwise:
/// 1. A token on the request (`Authorization: Bearer` or `?token=`) is
///    verified; failure answers 401 before the upgrade
/// 2. With no token the connection is admitted as [`Auth::Pending`] and the
///    handler requires the first message to authenticate
///
/// Layer order (outer to inner): connection_limit -> auth -> handler
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(authenticator) = state.authenticator() else {
        request.extensions_mut().insert(Auth::Disabled);
        return Ok(next.run(request).await);
    };

    let path = request.uri().path().to_string();
    match extract_token(&request) {
        Ok(token) => {
            let claims = authenticator.authenticate(&token).await.map_err(|e| {
                tracing::warn!(path = %path, error = %e, "Rejecting upgrade: authentication failed");
                e
            })?;
            tracing::info!(path = %path, uid = %claims.uid, "Upgrade authenticated");
            request.extensions_mut().insert(Auth::Verified(claims));
        }
        Err(AuthError::MissingToken) => {
            tracing::info!(path = %path, "No token on upgrade, enabling first-message auth");
            request.extensions_mut().insert(Auth::Pending);
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Rejecting upgrade: bad authorization header");
            return Err(e);
        }
    }

    Ok(next.run(request).await)
}
