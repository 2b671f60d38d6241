//! Firebase ID token verification
//!
//! Firebase ID tokens are RS256 JWTs signed by Google's `securetoken` service
//! account. A token is accepted when:
//! - its `kid` names a current signing key and the signature verifies
//! - `aud` is the Firebase project id
//! - `iss` is `https://securetoken.google.com/<project id>`
//! - `exp` is in the future and `iat` is not
//! - `sub` (the user id) is non-empty
//!
//! Signing keys are fetched as a JWK set and kept for the `max-age` the
//! endpoint advertises.

use async_trait::async_trait;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind, jwk::JwkSet,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AuthClaims, AuthError, AuthResult, TokenVerifier};

/// JWK set of the keys that sign Firebase ID tokens.
pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Used when the key endpoint sends no usable `max-age`
const DEFAULT_KEY_MAX_AGE: Duration = Duration::from_secs(3600);

/// Unknown key ids never trigger refetches closer together than this
const MIN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Allowed clock skew for `iat`
const CLOCK_SKEW_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct FirebaseClaims {
    sub: String,
    exp: u64,
    iat: u64,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
    max_age: Duration,
}

impl KeySet {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.max_age
    }
}

enum KeySource {
    Remote { client: reqwest::Client, url: String },
    /// Fixed keys, never refreshed
    Pinned,
}

/// Verifies Firebase ID tokens for one project.
pub struct FirebaseVerifier {
    project_id: String,
    validation: Validation,
    source: KeySource,
    keys: RwLock<Option<KeySet>>,
}

impl FirebaseVerifier {
    /// Verifier fetching Google's published signing keys.
    pub fn new(project_id: &str) -> AuthResult<Self> {
        Self::with_jwks_url(project_id, FIREBASE_JWKS_URL)
    }

    pub fn with_jwks_url(project_id: &str, url: &str) -> AuthResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(KEY_FETCH_TIMEOUT)
            .build()
            .map_err(|e| AuthError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            project_id: project_id.to_string(),
            validation: firebase_validation(project_id),
            source: KeySource::Remote {
                client,
                url: url.to_string(),
            },
            keys: RwLock::new(None),
        })
    }

    /// Verifier over a fixed set of keys by key id.
    pub fn with_keys(project_id: &str, keys: HashMap<String, DecodingKey>) -> Self {
        Self {
            project_id: project_id.to_string(),
            validation: firebase_validation(project_id),
            source: KeySource::Pinned,
            keys: RwLock::new(Some(KeySet {
                keys,
                fetched_at: Instant::now(),
                max_age: Duration::MAX,
            })),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn key_for(&self, kid: &str) -> AuthResult<DecodingKey> {
        let unknown = || AuthError::InvalidToken(format!("unknown key id '{kid}'"));

        {
            let keys = self.keys.read().await;
            if let Some(set) = keys.as_ref()
                && (matches!(self.source, KeySource::Pinned) || set.is_fresh(Instant::now()))
                && let Some(key) = set.keys.get(kid)
            {
                return Ok(key.clone());
            }
        }

        let KeySource::Remote { client, url } = &self.source else {
            return Err(unknown());
        };

        let mut keys = self.keys.write().await;
        let now = Instant::now();
        // Another verification may have refreshed while this one waited
        let refresh = match keys.as_ref() {
            Some(set) if set.is_fresh(now) => {
                !set.keys.contains_key(kid)
                    && now.saturating_duration_since(set.fetched_at) >= MIN_KEY_REFRESH_INTERVAL
            }
            _ => true,
        };
        if refresh {
            *keys = Some(fetch_keys(client, url).await?);
        }

        keys.as_ref()
            .and_then(|set| set.keys.get(kid))
            .cloned()
            .ok_or_else(unknown)
    }
}

#[async_trait]
impl TokenVerifier for FirebaseVerifier {
    async fn verify(&self, token: &str) -> AuthResult<AuthClaims> {
        let header =
            decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("missing key id".to_string()))?;
        let key = self.key_for(&kid).await?;

        let data = decode::<FirebaseClaims>(token, &key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        let claims = data.claims;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if claims.iat > now + CLOCK_SKEW_SECS {
            return Err(AuthError::InvalidToken("issued in the future".to_string()));
        }
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(AuthClaims {
            uid: claims.sub,
            email: claims.email,
            name: claims.name,
            exp: claims.exp,
        })
    }
}

fn firebase_validation(project_id: &str) -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[project_id]);
    validation.set_issuer(&[format!("https://securetoken.google.com/{project_id}")]);
    validation.set_required_spec_claims(&["exp", "iat", "aud", "iss", "sub"]);
    validation
}

/// Decoding keys by key id. Keys without an id or of an unusable type are
/// skipped.
pub fn keys_from_jwks(set: &JwkSet) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for jwk in &set.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            debug!("Skipping signing key without a key id");
            continue;
        };
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable signing key"),
        }
    }
    keys
}

async fn fetch_keys(client: &reqwest::Client, url: &str) -> AuthResult<KeySet> {
    let unavailable = |e: reqwest::Error| AuthError::KeysUnavailable(e.to_string());

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(unavailable)?;
    let max_age = response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_max_age)
        .unwrap_or(DEFAULT_KEY_MAX_AGE);
    let set: JwkSet = response.json().await.map_err(unavailable)?;

    let keys = keys_from_jwks(&set);
    if keys.is_empty() {
        return Err(AuthError::KeysUnavailable(
            "key set contains no usable keys".to_string(),
        ));
    }
    info!(count = keys.len(), max_age_secs = max_age.as_secs(), "Fetched token signing keys");
    Ok(KeySet {
        keys,
        fetched_at: Instant::now(),
        max_age,
    })
}

/// `max-age` from a `Cache-Control` header value.
fn parse_max_age(value: &str) -> Option<Duration> {
    value
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|secs| secs.trim().parse().ok())
        .map(Duration::from_secs)
}
