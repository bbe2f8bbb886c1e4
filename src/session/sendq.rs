//! Outbound line queue with urgent insertion and write throttling.
//!
//! Ordinary lines append; urgent lines (PONG replies to server PINGs) jump
//! the queue.  Because the unit of queueing is a whole line, an urgent
//! insertion can never split a partially written line.  The throttle
//! allows a budget of bytes per period, resetting the counter each window;
//! a line that would cross the budget waits for the next window (unless
//! the budget is untouched, so oversized lines cannot wedge the queue).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ThrottleSpec;

#[derive(Debug)]
struct Throttle {
    bytes: usize,
    period: Duration,
    used: usize,
    window_start: Instant,
}

/// Queue of lines awaiting transmission to the server.
#[derive(Debug, Default)]
pub struct SendQueue {
    lines: VecDeque<String>,
    throttle: Option<Throttle>,
}

impl SendQueue {
    /// Create a queue, throttled when `spec` is set.
    pub fn new(spec: Option<ThrottleSpec>) -> Self {
        SendQueue {
            lines: VecDeque::new(),
            throttle: spec.map(|s| Throttle {
                bytes: s.bytes,
                period: Duration::from_secs(s.period),
                used: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Append a line.
    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
    }

    /// Insert a line at the front of the queue.
    pub fn push_urgent(&mut self, line: String) {
        self.lines.push_front(line);
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Take the next line the throttle permits sending now, counting the
    /// line (plus CR LF) against the current window.
    pub fn pop_ready(&mut self, now: Instant) -> Option<String> {
        let line = self.lines.front()?;
        let cost = line.len() + 2;

        match self.throttle {
            None => self.lines.pop_front(),
            Some(ref mut t) => {
                if now.duration_since(t.window_start) >= t.period {
                    t.window_start = now;
                    t.used = 0;
                }
                if t.used + cost <= t.bytes || t.used == 0 {
                    t.used += cost;
                    self.lines.pop_front()
                } else {
                    None
                }
            }
        }
    }

    /// When a blocked queue may make progress again.
    pub fn next_window(&self) -> Option<Instant> {
        if self.lines.is_empty() {
            return None;
        }
        self.throttle.as_ref().map(|t| t.window_start + t.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttled(bytes: usize, period: u64) -> SendQueue {
        SendQueue::new(Some(ThrottleSpec { bytes, period }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unthrottled_fifo() {
        let mut q = SendQueue::new(None);
        q.push("one".into());
        q.push("two".into());
        assert_eq!(q.pop_ready(Instant::now()).as_deref(), Some("one"));
        assert_eq!(q.pop_ready(Instant::now()).as_deref(), Some("two"));
        assert!(q.pop_ready(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgent_jumps_queue() {
        let mut q = SendQueue::new(None);
        q.push("ordinary".into());
        q.push_urgent("PONG :srv".into());
        assert_eq!(q.pop_ready(Instant::now()).as_deref(), Some("PONG :srv"));
        assert_eq!(q.pop_ready(Instant::now()).as_deref(), Some("ordinary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_budget_per_window() {
        // 1024 bytes per 10 seconds, 3 KB queued: at most 1024 bytes may
        // leave in each window.
        let mut q = throttled(1024, 10);
        let line = "x".repeat(250); // 252 bytes with CR LF
        for _ in 0..12 {
            q.push(line.clone());
        }

        let now = Instant::now();
        let mut sent = 0usize;
        while let Some(l) = q.pop_ready(now) {
            sent += l.len() + 2;
        }
        assert!(sent <= 1024, "sent {sent} bytes in one window");
        assert!(!q.is_empty());

        // Window rolls over: more may leave
        let later = now + Duration::from_secs(10);
        let mut sent2 = 0usize;
        while let Some(l) = q.pop_ready(later) {
            sent2 += l.len() + 2;
        }
        assert!(sent2 > 0 && sent2 <= 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_line_not_wedged() {
        let mut q = throttled(16, 10);
        q.push("a line much longer than sixteen bytes".into());
        assert!(q.pop_ready(Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_window() {
        let mut q = throttled(8, 10);
        let now = Instant::now();
        q.push("12345678".into());
        q.push("12345678".into());
        assert!(q.pop_ready(now).is_some());
        assert!(q.pop_ready(now).is_none());
        let window = q.next_window().expect("blocked queue has a window");
        assert!(window <= now + Duration::from_secs(10));
    }
}
