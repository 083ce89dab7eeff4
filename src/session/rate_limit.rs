//! Sliding-window rate limiting over monotonic time

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counts events inside a moving window of monotonic time. Wall-clock skew
/// never reaches admission decisions.
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            events: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
        }
    }

    /// Record one event if the window has room; `false` means rate limited
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut events = self.events.lock();
        while let Some(&front) = events.front() {
            if now.duration_since(front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        if events.len() >= self.limit {
            return false;
        }
        events.push_back(now);
        true
    }

    pub fn current(&self) -> usize {
        let now = Instant::now();
        let mut events = self.events.lock();
        while let Some(&front) = events.front() {
            if now.duration_since(front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit() {
        let window = SlidingWindow::new(3, Duration::from_secs(60));
        assert!(window.try_acquire());
        assert!(window.try_acquire());
        assert!(window.try_acquire());
        assert!(!window.try_acquire());
        assert_eq!(window.current(), 3);
    }

    #[test]
    fn window_expiry_frees_slots() {
        let window = SlidingWindow::new(1, Duration::from_millis(20));
        assert!(window.try_acquire());
        assert!(!window.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(window.try_acquire());
    }
}
