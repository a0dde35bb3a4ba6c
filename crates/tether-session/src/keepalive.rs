//! Keepalive acknowledgment tracking.
//!
//! The client sends a KEEPALIVE with RESPOND on every tick. A tick counts as
//! missed once `ack_timeout` has passed without any acknowledgment since it
//! was sent; `missed_acks` consecutive missed ticks expire the link.

use std::collections::VecDeque;
use std::time::Duration;
use tether_core::KeepAliveConfig;
use tokio::time::Instant;

/// What to do on a keepalive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveTick {
    /// Send a KEEPALIVE requesting a response
    Send,
    /// Too many acknowledgments missed; the link is dead
    Expired { missed: u32 },
}

#[derive(Debug)]
pub struct KeepAliveTracker {
    ack_timeout: Duration,
    missed_acks: u32,
    /// Send times of ticks not yet acknowledged, oldest first
    unacknowledged: VecDeque<Instant>,
}

impl KeepAliveTracker {
    pub fn new(config: &KeepAliveConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout,
            missed_acks: config.missed_acks.max(1),
            unacknowledged: VecDeque::new(),
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> KeepAliveTick {
        let missed = self
            .unacknowledged
            .iter()
            .take_while(|sent| now.saturating_duration_since(**sent) >= self.ack_timeout)
            .count() as u32;
        if missed >= self.missed_acks {
            return KeepAliveTick::Expired { missed };
        }
        self.unacknowledged.push_back(now);
        KeepAliveTick::Send
    }

    /// Any acknowledgment clears every outstanding tick
    pub fn on_ack(&mut self) {
        self.unacknowledged.clear();
    }

    /// Forget outstanding ticks, e.g. after the link was replaced
    pub fn reset(&mut self) {
        self.unacknowledged.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.unacknowledged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KeepAliveConfig {
        KeepAliveConfig {
            interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(2),
            missed_acks: 2,
        }
    }

    #[test]
    fn test_expires_after_missed_acks() {
        let mut tracker = KeepAliveTracker::new(&config());
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);

        assert_eq!(tracker.on_tick(at(0)), KeepAliveTick::Send);
        assert_eq!(tracker.on_tick(at(1)), KeepAliveTick::Send);
        assert_eq!(tracker.on_tick(at(2)), KeepAliveTick::Send);
        // ticks at 0 and 1 are now both past the ack timeout
        assert_eq!(tracker.on_tick(at(3)), KeepAliveTick::Expired { missed: 2 });
    }

    #[test]
    fn test_ack_resets() {
        let mut tracker = KeepAliveTracker::new(&config());
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);

        for secs in 0..3 {
            assert_eq!(tracker.on_tick(at(secs)), KeepAliveTick::Send);
        }
        tracker.on_ack();
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.on_tick(at(3)), KeepAliveTick::Send);
        assert_eq!(tracker.on_tick(at(4)), KeepAliveTick::Send);
    }
}
