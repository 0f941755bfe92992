use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::{Registry, Unit};
use std::time::Duration;

/// Reconcile timing histograms, exported on the admin server when metrics
/// are enabled.
#[derive(Clone, Debug)]
pub struct SyncMetrics {
    sync: Histogram,
    policy_chains: Histogram,
}

// === impl SyncMetrics ===

impl SyncMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let sync = Histogram::new(exponential_buckets(0.004, 2.0, 12));
        registry.register_with_unit(
            "sync",
            "Time taken by one full reconcile of kernel state",
            Unit::Seconds,
            sync.clone(),
        );

        let policy_chains = Histogram::new(exponential_buckets(0.004, 2.0, 12));
        registry.register_with_unit(
            "policy_chains_sync",
            "Time taken by the per-policy chain phase of a reconcile",
            Unit::Seconds,
            policy_chains.clone(),
        );

        Self {
            sync,
            policy_chains,
        }
    }

    pub fn observe_sync(&self, elapsed: Duration) {
        self.sync.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn observe_policy_chains(&self, elapsed: Duration) {
        self.policy_chains.observe(elapsed.as_secs_f64());
    }
}
