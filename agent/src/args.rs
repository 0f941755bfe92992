use crate::node;
use crate::reconcile::{watch_liveness, Reconciler};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use netguard_firewall::{FirewallSync, IpsetCmd, IptablesCmd, SyncMetrics};
use netguard_k8s_api as k8s;
use netguard_k8s_index::{Index, Notifier, SchemaMode};
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netguard", about = "A per-node network policy enforcement agent")]
pub struct Args {
    #[clap(long, default_value = "netguard=info,warn", env = "NETGUARD_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Seconds between periodic reconciles of kernel state.
    #[clap(long, default_value = "300")]
    sync_period_secs: u64,

    /// Exports reconcile timing histograms on the admin server.
    #[clap(long)]
    metrics_enabled: bool,

    /// Name identifying the local node against the apiserver, instead of
    /// the HOSTNAME environment variable.
    #[clap(long)]
    hostname_override: Option<String>,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            sync_period_secs,
            metrics_enabled,
            hostname_override,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = metrics_enabled
            .then(|| SyncMetrics::register(prom.sub_registry_with_prefix("netguard")));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // The kernel utilities must be usable before anything is watched;
        // without them the agent cannot enforce at all.
        let filter = IptablesCmd::new();
        filter.probe().await.context("iptables is unavailable")?;
        let sets = IpsetCmd::new();
        sets.probe().await.context("ipset is unavailable")?;

        let node_ip = node::local_node_ip(&runtime.client(), hostname_override).await?;

        let version = runtime
            .client()
            .apiserver_version()
            .await
            .context("probing the apiserver version")?;
        let mode = SchemaMode::from_server_version(&version.major, &version.minor);
        info!(%node_ip, ?mode, "starting network policy agent");

        let (notifier, nudges) = Notifier::pair();
        let index = Index::shared(mode, notifier.clone());

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        match mode {
            SchemaMode::Current => {
                let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(index.clone(), policies)
                        .instrument(info_span!("networkpolicies")),
                );
            }
            SchemaMode::Legacy => {
                let policies =
                    runtime.watch_all::<k8s::legacy::NetworkPolicy>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(index.clone(), policies)
                        .instrument(info_span!("networkpolicies.extensions")),
                );
            }
        }

        let firewall = FirewallSync::new(filter, sets, metrics.clone());
        let (reconciler, heartbeats) =
            Reconciler::new(index, firewall, node_ip, mode, notifier, metrics);

        let period = Duration::from_secs(sync_period_secs);
        tokio::spawn(watch_liveness(heartbeats, period).instrument(info_span!("liveness")));
        tokio::spawn(
            reconciler
                .run(nudges, period, runtime.shutdown_handle())
                .instrument(info_span!("reconciler")),
        );

        // Block on the shutdown signal; the reconciler finishes its pass
        // and removes the installed rules before release.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}
