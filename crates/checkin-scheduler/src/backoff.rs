//! Retry backoff policy.

use std::time::Duration;

use crate::SchedulerError;

/// Exponent ceiling; delays are already at `max_delay` long before this.
const MAX_EXPONENT: u32 = 64;

/// Maps an attempt count to the delay before the next retry.
///
/// Pure and deterministic: no jitter, no clock. The runner supplies elapsed
/// time so the same policy can be driven by a virtual clock in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor per attempt (must be >= 1.0).
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Ceiling on total time spent retrying one reservation.
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            max_elapsed: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    /// Check that the policy can produce a non-decreasing, bounded schedule.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_attempts == 0 {
            return Err(SchedulerError::Configuration(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SchedulerError::Configuration(format!(
                "backoff multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(SchedulerError::Configuration(format!(
                "initial backoff {:?} exceeds maximum backoff {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Delay to wait after `attempt` failed attempts (1-based).
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` attempts and
    /// `elapsed` time spent retrying so far.
    pub fn allows_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts < self.max_attempts
            && elapsed.saturating_add(self.delay(attempts)) <= self.max_elapsed
    }
}
