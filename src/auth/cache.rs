use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::AuthClaims;

struct CachedToken {
    claims: AuthClaims,
    expires_at: Instant,
}

/// Recently verified tokens, each trusted until its TTL or the token's own
/// expiry, whichever comes first.
pub struct TokenCache {
    entries: DashMap<String, CachedToken>,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached claims for `token`, removing the entry if it has expired.
    pub fn get(&self, token: &str) -> Option<AuthClaims> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(token)
            && now < entry.expires_at
        {
            return Some(entry.claims.clone());
        }
        self.entries
            .remove_if(token, |_, entry| now >= entry.expires_at);
        None
    }

    /// Remember `claims` for at most `lifetime`.
    pub fn insert(&self, token: &str, claims: AuthClaims, lifetime: Duration) {
        let keep_for = self.ttl.min(lifetime);
        if keep_for.is_zero() {
            return;
        }
        self.entries.insert(
            token.to_string(),
            CachedToken {
                claims,
                expires_at: Instant::now() + keep_for,
            },
        );
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(uid: &str) -> AuthClaims {
        AuthClaims {
            uid: uid.to_string(),
            email: None,
            name: None,
            exp: u64::MAX,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = TokenCache::new(Duration::from_secs(300));
        cache.insert("t1", claims("a"), Duration::from_secs(3600));
        assert_eq!(cache.get("t1").map(|c| c.uid), Some("a".to_string()));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get("t1").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("t1").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expiry_caps_ttl() {
        let cache = TokenCache::new(Duration::from_secs(300));
        cache.insert("short", claims("a"), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.get("short").is_none());

        cache.insert("gone", claims("b"), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_expired() {
        let cache = TokenCache::new(Duration::from_secs(300));
        cache.insert("old", claims("a"), Duration::from_secs(60));
        cache.insert("new", claims("b"), Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }
}
