// src/controller/policy.rs

//! Timeouts and retry policy applied by the controller.

use std::time::Duration;

/// Capped exponential backoff for launch attempts.
///
/// `max_attempts` counts every attempt including the first, so the default of
/// `1` means "no retry".
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before attempt number `next_attempt` (2 for the first retry).
    pub fn backoff_before(&self, next_attempt: u32) -> Duration {
        let retries_so_far = next_attempt.saturating_sub(2);
        let factor = self.multiplier.max(1.0).powi(retries_so_far as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Controller knobs derived from the `[scheduler]` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub graceful_stop_timeout: Duration,
    pub liveness_timeout: Duration,
    pub output_idle_timeout: Option<Duration>,
    pub operation_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            graceful_stop_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(60 * 60),
            output_idle_timeout: None,
            operation_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_until_capped() {
        let p = policy();
        assert_eq!(p.backoff_before(2), Duration::from_millis(100));
        assert_eq!(p.backoff_before(3), Duration::from_millis(200));
        assert_eq!(p.backoff_before(4), Duration::from_millis(400));
        assert_eq!(p.backoff_before(5), Duration::from_millis(500));
        assert_eq!(p.backoff_before(40), Duration::from_millis(500));
    }

    #[test]
    fn attempt_cap_counts_first_attempt() {
        let p = policy();
        assert!(p.allows_another(4));
        assert!(!p.allows_another(5));
        assert!(!RetryPolicy::default().allows_another(1));
    }
}
