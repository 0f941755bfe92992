//! The single-writer reconcile loop.
//!
//! One background task performs every reconcile: it wakes on the periodic
//! ticker or on a (coalesced) change notification from the watch indexes,
//! and holds an exclusive mutex for the duration of each pass. On the stop
//! signal it finishes the pass in flight, tears down everything the agent
//! installed, and releases shutdown.

use anyhow::{Context, Result};
use netguard_firewall::{FirewallSync, Ipset, PacketFilter, SyncMetrics};
use netguard_k8s_index::{
    build_policy_model, local_policy_targets, Notifier, SchemaMode, SharedIndex,
};
use std::net::Ipv4Addr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Reconciler<P, S> {
    index: SharedIndex,
    firewall: FirewallSync<P, S>,
    node_ip: Ipv4Addr,
    mode: SchemaMode,
    notifier: Notifier,
    heartbeat: watch::Sender<Option<SystemTime>>,
    metrics: Option<SyncMetrics>,
    lock: tokio::sync::Mutex<()>,
}

// === impl Reconciler ===

impl<P: PacketFilter, S: Ipset> Reconciler<P, S> {
    pub fn new(
        index: SharedIndex,
        firewall: FirewallSync<P, S>,
        node_ip: Ipv4Addr,
        mode: SchemaMode,
        notifier: Notifier,
        metrics: Option<SyncMetrics>,
    ) -> (Self, watch::Receiver<Option<SystemTime>>) {
        let (heartbeat, heartbeats) = watch::channel(None);
        let reconciler = Self {
            index,
            firewall,
            node_ip,
            mode,
            notifier,
            heartbeat,
            metrics,
            lock: tokio::sync::Mutex::new(()),
        };
        (reconciler, heartbeats)
    }

    /// Runs until shutdown. The first tick fires immediately, performing
    /// the initial full sync; change notifications only take effect after
    /// that sync succeeds.
    pub async fn run(self, mut nudges: mpsc::Receiver<()>, period: Duration, shutdown: drain::Watch) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => debug!("periodic sync"),
                Some(()) = nudges.recv() => debug!("change-driven sync"),
                release = shutdown.clone().signaled() => {
                    info!("shutting down");
                    if let Err(error) = self.firewall.teardown().await {
                        error!(%error, "failed to remove installed rules");
                    }
                    drop(release);
                    return;
                }
            }

            match self.sync().await {
                Ok(()) => {
                    self.notifier.set_ready();
                    self.beat();
                }
                Err(error) => {
                    // The skipped heartbeat makes sustained failure visible.
                    warn!(%error, "sync failed; suppressing heartbeat");
                }
            }
        }
    }

    /// One reconcile: snapshot → model → apply → garbage-collect.
    pub async fn sync(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.beat();

        let start = Instant::now();
        let epoch = epoch_token()?;
        debug!(%epoch, "starting sync of kernel state");

        let snapshot = self.index.read().snapshot();
        let model =
            build_policy_model(&snapshot, self.mode).context("building the policy model")?;
        let local = local_policy_targets(&snapshot, &model, self.node_ip);
        debug!(
            policies = model.len(),
            ingress_pods = local.ingress.len(),
            egress_pods = local.egress.len(),
            "applying firewall plan"
        );

        self.firewall.apply(&model, &local, &epoch).await?;

        let elapsed = start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_sync(elapsed);
        }
        debug!(?elapsed, "sync complete");
        Ok(())
    }

    fn beat(&self) {
        let _ = self.heartbeat.send_replace(Some(SystemTime::now()));
    }
}

/// The reconciliation epoch: the start-of-reconcile Unix timestamp in
/// nanoseconds. Mixed into chain names so generations never collide.
fn epoch_token() -> Result<String> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the Unix epoch")?
        .as_nanos()
        .to_string())
}

/// Logs when the reconciler stops heartbeating: with a healthy loop the
/// gap never exceeds the sync period plus one reconcile.
pub(crate) async fn watch_liveness(
    mut heartbeats: watch::Receiver<Option<SystemTime>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let last = *heartbeats.borrow_and_update();
        if let Some(at) = last {
            match at.elapsed() {
                Ok(age) if age > period * 3 => {
                    warn!(?age, "no reconcile heartbeat; the agent may be wedged")
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_tokens_are_increasing_decimal_nanos() {
        let a = epoch_token().unwrap();
        let b = epoch_token().unwrap();
        assert!(a.chars().all(|c| c.is_ascii_digit()));
        assert!(b.parse::<u128>().unwrap() >= a.parse::<u128>().unwrap());
    }
}
