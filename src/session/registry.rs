use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::events::SessionCommand;
use super::machine::SessionHandle;

struct Entry {
    handle: SessionHandle,
    created_at: Instant,
    last_activity: Instant,
}

/// Live sessions by id.
///
/// Bounded at `max_sessions`: registering past the bound evicts the least
/// recently active session. Idle sessions are told to shut down by
/// [`sweep_idle`](Self::sweep_idle).
pub struct SessionRegistry {
    sessions: DashMap<String, Entry>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn register(&self, handle: SessionHandle) {
        while self.sessions.len() >= self.max_sessions {
            if !self.evict_oldest() {
                break;
            }
        }

        let now = Instant::now();
        let id = handle.id().to_string();
        self.sessions.insert(
            id.clone(),
            Entry {
                handle,
                created_at: now,
                last_activity: now,
            },
        );
        debug!(session_id = %id, active = self.sessions.len(), "Session registered");
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|entry| entry.last_activity)
            .map(|entry| entry.key().clone());

        let Some(id) = oldest else {
            return false;
        };
        if let Some((_, entry)) = self.sessions.remove(&id) {
            warn!(session_id = %id, max_sessions = self.max_sessions, "Session limit reached, evicting oldest");
            let _ = entry.handle.try_send(SessionCommand::Shutdown);
        }
        true
    }

    /// Record client activity on a session.
    pub fn touch(&self, id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id);
        if let Some((_, entry)) = &removed {
            debug!(
                session_id = %id,
                lifetime_secs = entry.created_at.elapsed().as_secs(),
                "Session unregistered"
            );
        }
        removed.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Shut down and drop sessions idle for longer than `timeout`.
    ///
    /// Returns the number of sessions removed.
    pub fn sweep_idle(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_activity) > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            if let Some((_, entry)) = self.sessions.remove(id) {
                info!(session_id = %id, "Closing idle session");
                let _ = entry.handle.try_send(SessionCommand::Shutdown);
            }
        }
        stale.len()
    }

    /// Spawn a task that calls [`sweep_idle`](Self::sweep_idle) every `period`.
    pub fn spawn_sweeper(self: &Arc<Self>, timeout: Duration, period: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let swept = registry.sweep_idle(timeout);
                if swept > 0 {
                    info!(swept, remaining = registry.len(), "Idle session sweep");
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.sessions.len())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}
