//! Named one-shot timers for a session.
//!
//! Each timer is a `(name, deadline)` pair owned by the session and polled
//! from its event loop.  Scheduling a name that is already pending is a
//! no-op; this is used pervasively as a once-in-flight guard (e.g. a
//! second `server_recon` while one is pending must not arm another).

use std::time::Duration;

use tokio::time::Instant;

/// The set of pending timers for one owner.
#[derive(Debug, Default)]
pub struct TimerSet {
    entries: Vec<(String, Instant)>,
}

impl TimerSet {
    /// Arm `name` to fire after `delay`.  Returns `false` (and changes
    /// nothing) when a timer of that name is already pending.
    pub fn schedule(&mut self, name: impl Into<String>, delay: Duration) -> bool {
        let name = name.into();
        if self.exists(&name) {
            return false;
        }
        self.entries.push((name, Instant::now() + delay));
        true
    }

    /// Arm `name` to fire at `deadline` (same once-in-flight rule).
    pub fn schedule_at(&mut self, name: impl Into<String>, deadline: Instant) -> bool {
        let name = name.into();
        if self.exists(&name) {
            return false;
        }
        self.entries.push((name, deadline));
        true
    }

    /// Whether a timer of this name is pending.
    pub fn exists(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Cancel a pending timer.  Returns whether one existed.
    pub fn cancel(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    /// Cancel everything; part of session teardown.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Wait for the earliest timer to expire, remove it and return its
    /// name.  Pends forever while no timer is armed (the event loop's
    /// other branches keep running).  Cancellation-safe: nothing is
    /// removed until the deadline has actually passed.
    pub async fn expired(&mut self) -> String {
        let earliest = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, at))| *at)
            .map(|(i, (_, at))| (i, *at));

        match earliest {
            Some((index, at)) => {
                tokio::time::sleep_until(at).await;
                self.entries.remove(index).0
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let mut timers = TimerSet::default();
        timers.schedule("late", Duration::from_secs(10));
        timers.schedule("early", Duration::from_secs(1));

        assert_eq!(timers.expired().await, "early");
        assert_eq!(timers.expired().await, "late");
    }

    #[tokio::test]
    async fn test_once_in_flight() {
        let mut timers = TimerSet::default();
        assert!(timers.schedule("server_recon", Duration::from_secs(5)));
        assert!(!timers.schedule("server_recon", Duration::from_secs(1)));
        assert!(timers.exists("server_recon"));
    }

    #[tokio::test]
    async fn test_cancel() {
        let mut timers = TimerSet::default();
        timers.schedule("server_ping", Duration::from_secs(5));
        assert!(timers.cancel("server_ping"));
        assert!(!timers.cancel("server_ping"));
        assert!(!timers.exists("server_ping"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_leaves_nothing_pending() {
        let mut timers = TimerSet::default();
        timers.schedule("a", Duration::from_millis(1));
        timers.schedule("b", Duration::from_millis(2));
        timers.clear();

        let raced = tokio::time::timeout(Duration::from_secs(1), timers.expired()).await;
        assert!(raced.is_err());
    }
}
