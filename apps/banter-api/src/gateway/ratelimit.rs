//! Per-connection, per-action rate limiting.
//!
//! Fixed one-minute windows held in process-local memory. A user who
//! reconnects to a different process starts a fresh window; this is an
//! abuse deterrent, not a hard quota, so the weaker cross-process guarantee
//! is accepted.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const WINDOW: Duration = Duration::from_secs(60);

/// Action kinds with independent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SendMessage,
    JoinRoom,
    Typing,
    PresenceUpdate,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::SendMessage => "send_message",
            Action::JoinRoom => "join_room",
            Action::Typing => "typing",
            Action::PresenceUpdate => "update_presence",
        }
    }
}

/// Per-minute thresholds per action kind.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub sends_per_min: u32,
    pub joins_per_min: u32,
    pub typing_per_min: u32,
    pub presence_per_min: u32,
}

impl RateLimits {
    fn threshold(&self, action: Action) -> u32 {
        match action {
            Action::SendMessage => self.sends_per_min,
            Action::JoinRoom => self.joins_per_min,
            Action::Typing => self.typing_per_min,
            Action::PresenceUpdate => self.presence_per_min,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            sends_per_min: 30,
            joins_per_min: 10,
            typing_per_min: 60,
            presence_per_min: 10,
        }
    }
}

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct RateLimiter {
    limits: RateLimits,
    windows: DashMap<(String, Action), Window>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    /// Consume one slot for (session, action). Called before any state
    /// mutation; on `Err(retry_after_secs)` the caller must have performed
    /// no side effect.
    pub fn check(&self, session_id: &str, action: Action) -> Result<(), u64> {
        let threshold = self.limits.threshold(action);
        let now = Instant::now();

        let mut window = self
            .windows
            .entry((session_id.to_string(), action))
            .or_insert_with(|| Window {
                started_at: now,
                count: 0,
            });

        if now.duration_since(window.started_at) >= WINDOW {
            window.started_at = now;
            window.count = 0;
        }

        if window.count < threshold {
            window.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(window.started_at);
            let retry_after = WINDOW.saturating_sub(elapsed).as_secs().max(1);
            Err(retry_after)
        }
    }

    /// Drop all windows owned by a session at teardown.
    pub fn forget_session(&self, session_id: &str) {
        self.windows.retain(|(sid, _), _| sid != session_id);
    }
}
