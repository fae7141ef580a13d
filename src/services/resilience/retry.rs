use rand::Rng;
use std::time::Duration;

/// Retry policy with exponential backoff and jitter.
///
/// Deliberately independent of the circuit breaker: adapters retry through a
/// policy and separately report outcomes to whichever breaker guards the
/// dependency.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub factor: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            factor: 1.5,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy used by the worker retry queue: 3 attempts, 500 ms base, x1.5
    pub fn pipeline() -> Self {
        Self::default()
    }

    /// Faster schedule for upstream transport retries
    pub fn transport() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
            factor: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Delay before retry number `attempt` (0-based):
    /// min(base * factor^attempt, max) with +/- jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter_factor > 0.0 {
            let mut rng = rand::rng();
            let jitter = 1.0 + (rng.random::<f64>() * 2.0 - 1.0) * self.jitter_factor;
            capped * jitter
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
