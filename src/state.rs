//! Shared application state
//!
//! One [`AppState`] is built in `main` from the loaded [`ServerConfig`] and
//! handed to every route. It owns the remote connector, the authenticator,
//! the session registry and the admission counters; sessions share nothing
//! else.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::core::remote::{GeminiConnector, RemoteConnector};
use crate::session::SessionRegistry;

/// Sliding window for per-IP connection attempts.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// How often stale attempt records are dropped.
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// How often the session registry looks for idle sessions.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// How often expired verified tokens are dropped.
const AUTH_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Why a WebSocket upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionLimitError {
    #[error("global connection limit reached")]
    GlobalLimitReached,

    #[error("per-IP connection limit reached")]
    PerIpLimitReached,

    #[error("too many connection attempts")]
    RateLimited,
}

/// Application state shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    connector: Option<Arc<dyn RemoteConnector>>,
    authenticator: Option<Arc<Authenticator>>,
    pub sessions: Arc<SessionRegistry>,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
    connection_attempts: DashMap<IpAddr, VecDeque<Instant>>,
}

impl AppState {
    /// Build the state for `config` and start the background sweepers.
    ///
    /// Without an API key the server still starts; `/ready` reports
    /// not ready and relay upgrades are refused.
    ///
    /// When authentication is required but cannot be set up, every upgrade
    /// is refused rather than admitted unauthenticated.
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        let connector: Option<Arc<dyn RemoteConnector>> = match config.gemini_config() {
            Ok(gemini) => Some(Arc::new(GeminiConnector::new(gemini))),
            Err(e) => {
                warn!("Model channel not configured: {}", e);
                None
            }
        };
        let state = Self::with_connector(config, connector);
        state.spawn_sweepers();
        state
    }

    /// Build the state around an explicit connector. No sweepers are started.
    pub fn with_connector(
        config: ServerConfig,
        connector: Option<Arc<dyn RemoteConnector>>,
    ) -> Arc<Self> {
        let authenticator = match Authenticator::from_config(&config) {
            Ok(authenticator) => authenticator,
            Err(e) => {
                error!("Authentication not available: {}", e);
                Some(Arc::new(Authenticator::refusing(e)))
            }
        };
        Self::with_parts(config, connector, authenticator)
    }

    /// Build the state from explicit parts. No sweepers are started.
    pub fn with_parts(
        config: ServerConfig,
        connector: Option<Arc<dyn RemoteConnector>>,
        authenticator: Option<Arc<Authenticator>>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new(config.max_sessions));
        Arc::new(Self {
            config,
            connector,
            authenticator,
            sessions,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
            connection_attempts: DashMap::new(),
        })
    }

    fn spawn_sweepers(self: &Arc<Self>) {
        self.sessions
            .spawn_sweeper(self.config.session_idle_timeout(), SESSION_SWEEP_INTERVAL);

        let state: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(RATE_LIMITER_CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let removed = state.sweep_connection_attempts();
                if removed > 0 {
                    debug!(removed, "Cleaned up stale rate limit entries");
                }
            }
        });

        if self.authenticator.is_some() {
            let state: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = interval(AUTH_CACHE_SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(state) = state.upgrade() else {
                        break;
                    };
                    if let Some(removed) = state.authenticator.as_ref().map(|a| a.sweep())
                        && removed > 0
                    {
                        debug!(removed, "Cleaned up expired tokens");
                    }
                }
            });
        }
    }

    pub fn connector(&self) -> Option<&Arc<dyn RemoteConnector>> {
        self.connector.as_ref()
    }

    /// Token verification, present when authentication is required.
    pub fn authenticator(&self) -> Option<&Arc<Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Whether sessions can be started.
    pub fn is_ready(&self) -> bool {
        self.connector.is_some()
    }

    // =========================================================================
    // Origin policy
    // =========================================================================

    /// Check a WebSocket `Origin` header. A missing origin passes only when
    /// `allow_no_origin` is set.
    pub fn is_origin_permitted(&self, origin: Option<&str>) -> bool {
        match origin {
            Some(origin) => self.config.is_origin_allowed(origin),
            None => self.config.allow_no_origin,
        }
    }

    // =========================================================================
    // Connection rate
    // =========================================================================

    /// Record an upgrade attempt from `ip`, refusing it when the IP already
    /// made `max_connections_per_minute` attempts inside the window.
    pub fn check_connection_rate(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let now = Instant::now();
        let mut attempts = self.connection_attempts.entry(ip).or_default();
        while let Some(first) = attempts.front() {
            if now.saturating_duration_since(*first) >= RATE_LIMIT_WINDOW {
                attempts.pop_front();
            } else {
                break;
            }
        }

        if attempts.len() >= self.config.max_connections_per_minute {
            return Err(ConnectionLimitError::RateLimited);
        }
        attempts.push_back(now);
        Ok(())
    }

    /// Drop attempt records that fell out of the window.
    ///
    /// Returns the number of IPs forgotten.
    pub fn sweep_connection_attempts(&self) -> usize {
        let now = Instant::now();
        let before = self.connection_attempts.len();
        self.connection_attempts.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_duration_since(*t) < RATE_LIMIT_WINDOW);
            !attempts.is_empty()
        });
        before.saturating_sub(self.connection_attempts.len())
    }

    // =========================================================================
    // Concurrent connections
    // =========================================================================

    /// Reserve a connection slot for `ip`.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let previous = self.ws_connections.fetch_add(1, Ordering::AcqRel);
        if let Some(max) = self.config.max_websocket_connections
            && previous >= max
        {
            self.ws_connections.fetch_sub(1, Ordering::AcqRel);
            return Err(ConnectionLimitError::GlobalLimitReached);
        }

        let mut count = self.ip_connections.entry(ip).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            drop(count);
            self.ws_connections.fetch_sub(1, Ordering::AcqRel);
            return Err(ConnectionLimitError::PerIpLimitReached);
        }
        *count += 1;
        Ok(())
    }

    /// Return a slot taken with [`try_acquire_connection`](Self::try_acquire_connection).
    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if let Some(mut count) = self.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.ip_connections.remove_if(&ip, |_, count| *count == 0);
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }

    /// Log the admission summary once at startup.
    pub fn log_limits(&self) {
        info!(
            max_websocket_connections = ?self.config.max_websocket_connections,
            max_connections_per_ip = self.config.max_connections_per_ip,
            max_connections_per_minute = self.config.max_connections_per_minute,
            max_sessions = self.config.max_sessions,
            auth_required = self.authenticator.is_some(),
            "Admission limits"
        );
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .field("authenticator", &self.authenticator)
            .field("sessions", &self.sessions)
            .field("ws_connections", &self.ws_connection_count())
            .finish()
    }
}
