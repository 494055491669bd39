//! Retry policy: exponential backoff with jitter, per-call deadlines.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters for a class of router calls.
///
/// Each controller gets its own call deadline; the backoff schedule itself
/// (1 s initial, doubling, 3 attempts) is shared.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Hard deadline applied to every individual call attempt.
    pub call_deadline: Duration,
}

impl RetryPolicy {
    pub fn autorate() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            call_deadline: Duration::from_secs(15),
        }
    }

    pub fn steering() -> Self {
        RetryPolicy {
            call_deadline: Duration::from_secs(30),
            ..Self::autorate()
        }
    }

    pub fn calibration() -> Self {
        RetryPolicy {
            call_deadline: Duration::from_secs(10),
            ..Self::autorate()
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered to ±50 %.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jittered = base * rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(jittered)
    }
}
