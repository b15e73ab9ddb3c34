//! Engine configuration.

use crate::retry::RetryPolicy;

/// Configuration for the flow engine.
///
/// Controls worker-pool bounds, event buffering and the retry policies
/// applied by the hospital, the propagation sub-loop and the restart path.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use causeway::{EngineConfig, RetryPolicy};
///
/// let config = EngineConfig {
///     flow_workers: 4,
///     retry_policy: RetryPolicy {
///         base_delay: Duration::from_millis(1),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of flows processing an event at the same time.
    ///
    /// Each flow is strictly sequential; this bounds cross-flow
    /// parallelism. A suspended flow does not hold a worker slot.
    /// Default: 8.
    pub flow_workers: usize,

    /// Capacity of each flow's event queue. Submissions beyond this apply
    /// backpressure to the submitter. Default: 32.
    pub event_buffer: usize,

    /// Retry policy for discharged (transient) failures. `max_attempts` is
    /// the hospital's retry budget.
    pub retry_policy: RetryPolicy,

    /// Retry policy for the error-propagation sub-loop.
    pub propagation_policy: RetryPolicy,

    /// Retry policy for the restart/reload path itself (the manager-level
    /// double fault).
    pub restart_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_workers: 8,
            event_buffer: 32,
            retry_policy: RetryPolicy::default(),
            propagation_policy: RetryPolicy::default(),
            restart_policy: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.flow_workers, 8);
        assert_eq!(config.event_buffer, 32);
        assert_eq!(config.retry_policy.max_attempts, 3);
        assert_eq!(config.propagation_policy.max_attempts, 3);
        assert_eq!(config.restart_policy.max_attempts, 3);
    }
}
