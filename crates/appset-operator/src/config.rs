//! Controller configuration
//!
//! Everything here is operator-level tuning set via flags or environment,
//! never via the ApplicationSet API.

use std::time::Duration;

/// Tunables for the reconciler.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers. The work queue serialises per key, so
    /// no two workers ever process the same ApplicationSet.
    pub workers: u16,

    /// Per-generator I/O timeout
    pub generator_timeout: Duration,

    /// Overall deadline for one reconcile
    pub reconcile_deadline: Duration,

    /// How long a RollingSync step must stay healthy before the next step
    /// is released
    pub rollout_dwell: Duration,

    /// How long a RollingSync step may stay unhealthy before the rollout
    /// is marked stalled
    pub rollout_budget: Duration,

    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            generator_timeout: Duration::from_secs(30),
            reconcile_deadline: Duration::from_secs(300),
            rollout_dwell: Duration::from_secs(10),
            rollout_budget: Duration::from_secs(300),
            namespace: None,
        }
    }
}
