use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Session lifecycle.
///
/// `Connecting -> Ready -> Active <-> Interrupted -> Closing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Connecting,
    Ready,
    Active,
    Interrupted,
    Closing,
    Closed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Connecting => "connecting",
            Lifecycle::Ready => "ready",
            Lifecycle::Active => "active",
            Lifecycle::Interrupted => "interrupted",
            Lifecycle::Closing => "closing",
            Lifecycle::Closed => "closed",
        }
    }

    /// Whether audio is flowing in both directions.
    pub fn is_live(&self) -> bool {
        matches!(self, Lifecycle::Active | Lifecycle::Interrupted)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Closing | Lifecycle::Closed)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the avatar should be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarState {
    #[default]
    Idle,
    Listening,
    Speaking,
}

impl AvatarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarState::Idle => "idle",
            AvatarState::Listening => "listening",
            AvatarState::Speaking => "speaking",
        }
    }
}

impl fmt::Display for AvatarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Barge-in bookkeeping. While active, inbound model audio is discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptState {
    active: bool,
    triggered_at: Option<Instant>,
}

impl InterruptState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Time of the last trigger that ran the full interrupt procedure.
    pub fn triggered_at(&self) -> Option<Instant> {
        self.triggered_at
    }

    pub fn set(&mut self, at: Instant) {
        self.active = true;
        self.triggered_at = Some(at);
    }

    pub fn clear(&mut self) {
        self.active = false;
    }

    /// Whether a trigger at `at` falls inside the re-trigger window of the
    /// previous one and should be merged into it.
    ///
    /// A merged trigger does not extend the debounce timer; the deadline set
    /// by the first trigger stands.
    pub fn merges(&self, at: Instant, window: Duration) -> bool {
        match (self.active, self.triggered_at) {
            (true, Some(last)) => at.saturating_duration_since(last) < window,
            _ => false,
        }
    }
}
