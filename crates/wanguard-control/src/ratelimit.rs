//! Sliding-window limiter for router configuration writes.
//!
//! The router's flash and config churn are the shared resource being
//! protected: at most `max_changes` shaper updates per `window`. Callers
//! pass `now` explicitly so the limiter stays a pure data structure.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ChangeRateLimiter {
    window: Duration,
    max_changes: usize,
    events: VecDeque<Instant>,
}

impl ChangeRateLimiter {
    pub fn new(max_changes: usize, window: Duration) -> Self {
        ChangeRateLimiter {
            window,
            max_changes,
            events: VecDeque::with_capacity(max_changes),
        }
    }

    /// Whether a change is allowed at `now`. An allowed change is recorded.
    pub fn allow(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() < self.max_changes {
            self.events.push_back(now);
            true
        } else {
            false
        }
    }

    /// Changes currently counted inside the window.
    pub fn in_window(&self) -> usize {
        self.events.len()
    }
}
