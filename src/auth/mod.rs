//! Client authentication
//!
//! When `REQUIRE_AUTH` is set, every relay connection must present a Firebase
//! ID token before its session starts, either on the upgrade request
//! (`Authorization: Bearer <token>` or `?token=<token>`) or in its first
//! WebSocket message (`{"type": "auth", "token": ...}`, or an `auth_token`
//! field on any other message).
//!
//! Verified tokens are cached for a short TTL so reconnecting clients do not
//! pay for signature verification again.

pub mod cache;
pub mod firebase;

use async_trait::async_trait;
use axum::{
    Json,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use cache::TokenCache;
pub use firebase::{FIREBASE_JWKS_URL, FirebaseVerifier};

use crate::config::ServerConfig;
use crate::session::ErrorNotice;

/// Errors raised while authenticating a client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid authorization header")]
    InvalidAuthHeader,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,

    /// The signing keys could not be fetched
    #[error("Signing keys unavailable: {0}")]
    KeysUnavailable(String),

    #[error("Authentication misconfigured: {0}")]
    ConfigError(String),
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidAuthHeader
            | AuthError::InvalidToken(_)
            | AuthError::Expired => StatusCode::UNAUTHORIZED,
            AuthError::KeysUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing error for a failed in-band authentication.
    pub fn notice(&self) -> ErrorNotice {
        match self {
            AuthError::KeysUnavailable(_) | AuthError::ConfigError(_) => {
                ErrorNotice::new("auth_unavailable", "Authentication is temporarily unavailable.")
                    .with_action("Please try again.")
            }
            _ => ErrorNotice::new("unauthorized", self.to_string())
                .with_action("Please sign in again."),
        }
    }
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let error = match self.status_code() {
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::SERVICE_UNAVAILABLE => "auth_unavailable",
            _ => "auth_misconfigured",
        };
        let body = AuthErrorBody {
            error,
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Identity taken from a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Firebase user id
    #[serde(rename = "sub")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry as seconds since the Unix epoch
    pub exp: u64,
}

impl AuthClaims {
    /// Time left before the token expires, zero once it has.
    pub fn remaining_lifetime(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Duration::from_secs(self.exp.saturating_sub(now))
    }
}

/// Verifies one bearer token.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> AuthResult<AuthClaims>;
}

/// Authentication state of one relay connection, carried in request
/// extensions from `auth_middleware` to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Authentication is not required
    Disabled,
    Verified(AuthClaims),
    /// No token on the upgrade; the first message must carry one
    Pending,
}

impl Auth {
    pub fn is_pending(&self) -> bool {
        matches!(self, Auth::Pending)
    }

    pub fn uid(&self) -> Option<&str> {
        match self {
            Auth::Verified(claims) => Some(&claims.uid),
            _ => None,
        }
    }
}

/// Fails every verification with the error that prevented setup.
struct Refusing(AuthError);

#[async_trait]
impl TokenVerifier for Refusing {
    async fn verify(&self, _token: &str) -> AuthResult<AuthClaims> {
        Err(self.0.clone())
    }
}

/// Token verification behind a cache of recently verified tokens.
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    cache: TokenCache,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, cache_ttl: Duration) -> Self {
        Self {
            verifier,
            cache: TokenCache::new(cache_ttl),
        }
    }

    /// An authenticator that rejects every token with `error`.
    pub fn refusing(error: AuthError) -> Self {
        Self::new(Arc::new(Refusing(error)), Duration::ZERO)
    }

    /// Build the Firebase authenticator when `config` requires auth.
    pub fn from_config(config: &ServerConfig) -> AuthResult<Option<Arc<Self>>> {
        if !config.auth_required {
            return Ok(None);
        }
        let project_id = config
            .firebase_project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AuthError::ConfigError("FIREBASE_PROJECT_ID not set".to_string()))?;

        let verifier = FirebaseVerifier::new(project_id)?;
        info!(project_id, "Firebase authentication enabled");
        Ok(Some(Arc::new(Self::new(
            Arc::new(verifier),
            config.auth_token_cache_ttl(),
        ))))
    }

    /// Verify `token`, answering from the cache when possible.
    pub async fn authenticate(&self, token: &str) -> AuthResult<AuthClaims> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        if let Some(claims) = self.cache.get(token) {
            debug!(uid = %claims.uid, "Token verified from cache");
            return Ok(claims);
        }

        match self.verifier.verify(token).await {
            Ok(claims) => {
                info!(uid = %claims.uid, "Token verified");
                let lifetime = claims.remaining_lifetime();
                self.cache.insert(token, claims.clone(), lifetime);
                Ok(claims)
            }
            Err(e) => {
                warn!(error = %e, "Token verification failed");
                Err(e)
            }
        }
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.cache.sweep()
    }

    pub fn cached_tokens(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("cached_tokens", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Extract a bearer token from the upgrade request.
///
/// Browsers cannot set headers on WebSocket upgrades, so `?token=` is
/// accepted as well. The header wins when both are present.
pub fn extract_token<B>(request: &Request<B>) -> AuthResult<String> {
    if let Some(header) = request.headers().get("authorization") {
        let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return value
            .strip_prefix("Bearer ")
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::InvalidAuthHeader);
    }

    if let Some(query) = request.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" && !value.is_empty() {
                return Ok(value.into_owned());
            }
        }
    }

    Err(AuthError::MissingToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVerifier {
        calls: AtomicUsize,
        exp: u64,
    }

    #[async_trait]
    impl TokenVerifier for CountingVerifier {
        async fn verify(&self, token: &str) -> AuthResult<AuthClaims> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match token {
                "good" => Ok(AuthClaims {
                    uid: "user-1".to_string(),
                    email: Some("visitor@example.com".to_string()),
                    name: None,
                    exp: self.exp,
                }),
                _ => Err(AuthError::InvalidToken("bad signature".to_string())),
            }
        }
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn authenticator(exp: u64) -> (Authenticator, Arc<CountingVerifier>) {
        let verifier = Arc::new(CountingVerifier {
            calls: AtomicUsize::new(0),
            exp,
        });
        (
            Authenticator::new(verifier.clone(), Duration::from_secs(300)),
            verifier,
        )
    }

    #[tokio::test]
    async fn test_verified_token_is_cached() {
        let (auth, verifier) = authenticator(unix_now() + 3600);

        let claims = auth.authenticate("good").await.unwrap();
        assert_eq!(claims.uid, "user-1");
        assert_eq!(auth.authenticate("good").await.unwrap(), claims);

        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.cached_tokens(), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_is_not_cached() {
        let (auth, verifier) = authenticator(unix_now() + 3600);

        assert!(matches!(
            auth.authenticate("forged").await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(auth.authenticate("forged").await.is_err());
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(auth.cached_tokens(), 0);
    }

    #[tokio::test]
    async fn test_blank_token_skips_verifier() {
        let (auth, verifier) = authenticator(unix_now() + 3600);
        assert_eq!(auth.authenticate("  ").await, Err(AuthError::MissingToken));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_claims_are_not_cached() {
        // Verifier accepted it, but the token has no lifetime left
        let (auth, verifier) = authenticator(unix_now().saturating_sub(10));
        auth.authenticate("good").await.unwrap();
        auth.authenticate("good").await.unwrap();
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refusing_authenticator_rejects_everything() {
        let auth = Authenticator::refusing(AuthError::ConfigError("no project".into()));
        assert_eq!(
            auth.authenticate("anything").await,
            Err(AuthError::ConfigError("no project".into()))
        );
        assert_eq!(auth.cached_tokens(), 0);
    }

    #[test]
    fn test_from_config_disabled_by_default() {
        assert!(Authenticator::from_config(&ServerConfig::default())
            .unwrap()
            .is_none());

        let mut config = ServerConfig::default();
        config.auth_required = true;
        assert!(matches!(
            Authenticator::from_config(&config),
            Err(AuthError::ConfigError(_))
        ));

        config.firebase_project_id = Some("museum-avatar".to_string());
        assert!(Authenticator::from_config(&config).unwrap().is_some());
    }

    #[test]
    fn test_extract_token_sources() {
        let header = Request::builder()
            .uri("/ws?token=from-query")
            .header("authorization", "Bearer from-header")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&header).unwrap(), "from-header");

        let query = Request::builder()
            .uri("/ws?lang=en&token=abc%2Edef")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&query).unwrap(), "abc.def");

        let basic = Request::builder()
            .uri("/ws")
            .header("authorization", "Basic dXNlcg==")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&basic), Err(AuthError::InvalidAuthHeader));

        let none = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        assert_eq!(extract_token(&none), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_error_status_and_notice() {
        assert_eq!(AuthError::Expired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::KeysUnavailable("timeout".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AuthError::Expired.notice().error_type, "unauthorized");
        assert_eq!(
            AuthError::KeysUnavailable("timeout".into()).notice().error_type,
            "auth_unavailable"
        );
    }
}
