/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Keepalive management.
//!
//! This module handles session keepalive timing:
//! - Sending a Sequence message when nothing was sent for one interval
//! - Detecting a lapse when nothing was received for one interval
//! - Counting consecutive lapses so the second one can end the session
//!
//! Time is always passed in by the caller, so the owning event loop decides
//! what "now" is.

use std::time::{Duration, Instant};

/// Manages keepalive timing for a session.
#[derive(Debug)]
pub struct KeepaliveManager {
    /// Keepalive interval.
    interval: Duration,
    /// Time of last message sent.
    last_sent: Instant,
    /// Time of last message received, or of the last lapse.
    last_received: Instant,
    /// Consecutive lapses without inbound traffic.
    lapses: u32,
}

impl KeepaliveManager {
    /// Creates a new keepalive manager with the specified interval.
    ///
    /// # Arguments
    /// * `interval` - The keepalive interval
    /// * `now` - Start of the first interval
    #[must_use]
    pub const fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_sent: now,
            last_received: now,
            lapses: 0,
        }
    }

    /// Records that a message was sent.
    #[inline]
    pub fn on_message_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Records that a message was received and clears any lapse.
    #[inline]
    pub fn on_message_received(&mut self, now: Instant) {
        self.last_received = now;
        self.lapses = 0;
    }

    /// Checks if a keepalive should be sent.
    #[must_use]
    pub fn should_send_keepalive(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.interval
    }

    /// Checks if one interval passed without inbound traffic.
    #[must_use]
    pub fn is_lapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) >= self.interval
    }

    /// Records a lapse and starts a new receive interval.
    ///
    /// Returns the number of consecutive lapses including this one.
    pub fn on_lapse(&mut self, now: Instant) -> u32 {
        self.lapses += 1;
        self.last_received = now;
        self.lapses
    }

    /// Returns the number of consecutive lapses.
    #[must_use]
    pub const fn lapses(&self) -> u32 {
        self.lapses
    }

    /// Returns the time since the last message was received.
    #[must_use]
    pub fn time_since_last_received(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received)
    }

    /// Returns the keepalive interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Replaces the interval, e.g. with the one granted during establish.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Resets the manager state.
    pub fn reset(&mut self, now: Instant) {
        self.last_sent = now;
        self.last_received = now;
        self.lapses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    #[test]
    fn test_keepalive_manager_new() {
        let now = Instant::now();
        let mgr = KeepaliveManager::new(INTERVAL, now);
        assert_eq!(mgr.interval(), INTERVAL);
        assert_eq!(mgr.lapses(), 0);
        assert!(!mgr.should_send_keepalive(now));
        assert!(!mgr.is_lapsed(now));
    }

    #[test]
    fn test_should_send_keepalive() {
        let start = Instant::now();
        let mut mgr = KeepaliveManager::new(INTERVAL, start);
        assert!(!mgr.should_send_keepalive(start + Duration::from_secs(29)));
        assert!(mgr.should_send_keepalive(start + INTERVAL));

        mgr.on_message_sent(start + INTERVAL);
        assert!(!mgr.should_send_keepalive(start + INTERVAL + Duration::from_secs(1)));
    }

    #[test]
    fn test_lapse_counting() {
        let start = Instant::now();
        let mut mgr = KeepaliveManager::new(INTERVAL, start);

        let first = start + INTERVAL;
        assert!(mgr.is_lapsed(first));
        assert_eq!(mgr.on_lapse(first), 1);
        assert!(!mgr.is_lapsed(first + Duration::from_secs(1)));

        let second = first + INTERVAL;
        assert!(mgr.is_lapsed(second));
        assert_eq!(mgr.on_lapse(second), 2);
        assert_eq!(mgr.time_since_last_received(second), Duration::ZERO);
    }

    #[test]
    fn test_received_traffic_clears_lapse() {
        let start = Instant::now();
        let mut mgr = KeepaliveManager::new(INTERVAL, start);
        mgr.on_lapse(start + INTERVAL);

        mgr.on_message_received(start + INTERVAL + Duration::from_secs(2));
        assert_eq!(mgr.lapses(), 0);

        mgr.set_interval(Duration::from_secs(5));
        mgr.reset(start);
        assert!(mgr.is_lapsed(start + Duration::from_secs(5)));
    }
}
