//! Connection states and the no-progress watchdog.

use std::time::{Duration, Instant};

/// Threshold after which a silent peer is dropped during connect.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(120_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    CatalogSync,
    Joined,
    Active,
    Disconnected,
}

impl ConnectionState {
    /// States during which the watchdog must be running.
    pub fn is_watched(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::CatalogSync
        )
    }
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    threshold: Duration,
    deadline: Instant,
}

impl Watchdog {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            deadline: now + threshold,
        }
    }

    /// Restarts the countdown; called on every inbound message.
    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + self.threshold;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_expires_without_reset() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_secs(2), start);

        assert!(!watchdog.is_expired(start + Duration::from_secs(1)));
        watchdog.reset(start + Duration::from_secs(1));
        assert!(!watchdog.is_expired(start + Duration::from_secs(2)));
        assert!(watchdog.is_expired(start + Duration::from_secs(3)));
        assert_eq!(watchdog.remaining(start + Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_watched_states() {
        assert!(ConnectionState::Handshaking.is_watched());
        assert!(ConnectionState::CatalogSync.is_watched());
        assert!(!ConnectionState::Active.is_watched());
        assert!(!ConnectionState::Disconnected.is_watched());
    }
}
