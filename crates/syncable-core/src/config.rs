//! Store configuration and retry policy.

use std::time::Duration;

/// Bounded retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }
}

/// Calculates the delay after a failed `attempt` (1-based) using exponential backoff.
pub fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let delay_secs = policy.initial_delay.as_secs_f64()
        * policy.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(policy.max_delay.as_secs_f64()))
}

/// Tunables shared by a store's backing, object stores and notifier.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long to wait for a path lock before failing with `LockTimeout`.
    pub lock_timeout: Duration,
    /// Policy for optimistic read-modify-write loops.
    pub update_retry: RetryPolicy,
    /// Debounce window for change notifications.
    pub notification_debounce: Duration,
    /// Page size for paginated enumerations.
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            update_retry: RetryPolicy::default(),
            notification_debounce: Duration::from_millis(250),
            page_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(calculate_backoff(1, &policy), Duration::from_millis(5));
        assert_eq!(calculate_backoff(2, &policy), Duration::from_millis(10));
        assert_eq!(calculate_backoff(3, &policy), Duration::from_millis(20));
        assert_eq!(calculate_backoff(20, &policy), Duration::from_millis(200));
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(calculate_backoff(1, &policy), Duration::ZERO);
        assert_eq!(calculate_backoff(5, &policy), Duration::ZERO);
    }
}
