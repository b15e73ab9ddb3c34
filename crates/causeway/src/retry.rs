//! Retry policy configuration for triaged failures.

use std::time::Duration;

/// Configuration for automatic retry behavior with exponential backoff.
///
/// `max_attempts` is the hospital's retry budget: the number of times a
/// flow is discharged (retried from its last checkpoint) for the same error
/// signature before the diagnosis flips to observation. The same shape
/// governs the error-propagation sub-loop and the manager's restart path.
///
/// # Backoff Calculation
///
/// The delay before retry N is: `min(base_delay * 2^(N-1), max_delay)`
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use causeway::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
///
/// // Near-immediate retries for tests
/// let fast = RetryPolicy {
///     max_attempts: 3,
///     base_delay: Duration::from_millis(1),
///     max_delay: Duration::from_millis(5),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget: failures beyond this many consecutive retries stop
    /// being retried automatically. Default: 3.
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    ///
    /// The delay doubles with each retry. Default: 25ms.
    pub base_delay: Duration,

    /// Maximum delay between retries.
    ///
    /// Caps the exponential growth. Default: 2 seconds.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay for a given attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        // Exponential backoff: base * 2^(attempt-1), capped at max
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Returns `true` if another retry should be attempted.
    ///
    /// # Arguments
    ///
    /// * `failures` - How many consecutive failures have occurred (1-based)
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(25));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        };

        assert_eq!(policy.backoff_duration(1), Duration::from_secs(1)); // 1 * 2^0
        assert_eq!(policy.backoff_duration(2), Duration::from_secs(2)); // 1 * 2^1
        assert_eq!(policy.backoff_duration(3), Duration::from_secs(4)); // 1 * 2^2
        assert_eq!(policy.backoff_duration(4), Duration::from_secs(8)); // 1 * 2^3
    }

    #[test]
    fn backoff_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };

        // 1 * 2^9 = 512, but capped at 60
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(60));
    }

    #[test]
    fn budget_of_three_allows_three_retries() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
