//! Server keepalive tracking.

use std::time::Duration;

use tokio::time::Instant;

/// Timeouts at or below this value disable the check.
pub const MIN_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks when the server was last heard from.
///
/// Not timer driven: the read loop asks [`is_expired_at`](Self::is_expired_at)
/// each time a receive returns. The monitor stays unarmed until the first
/// `ka` frame, so servers that never send keepalives are not timed out.
#[derive(Clone, Debug)]
pub(crate) struct KeepaliveMonitor {
    timeout: Option<Duration>,
    last_seen: Option<Instant>,
}

impl KeepaliveMonitor {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout: (timeout > MIN_KEEPALIVE_TIMEOUT).then_some(timeout),
            last_seen: None,
        }
    }

    /// Record a `ka` frame.
    pub(crate) fn arm(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    /// Record any other frame. Has no effect until armed.
    pub(crate) fn touch(&mut self, now: Instant) {
        if self.last_seen.is_some() {
            self.last_seen = Some(now);
        }
    }

    pub(crate) fn is_expired_at(&self, now: Instant) -> bool {
        match (self.timeout, self.last_seen) {
            (Some(timeout), Some(last_seen)) => now.saturating_duration_since(last_seen) > timeout,
            _ => false,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }
}
