//! The planner/applier: materializes the policy model into chains, sets,
//! and rules for one reconcile epoch, then garbage-collects whatever older
//! epochs left behind.
//!
//! Every mutation is idempotent (unique appends, existence-checked inserts,
//! exists-tolerant creates), so a partially-applied epoch is harmless: the
//! next reconcile reproduces the full desired state and sweeps stragglers
//! by name prefix.

use crate::ipset::{Ipset, SetKind, SetMember};
use crate::iptables::{PacketFilter, Rule, SetDir};
use crate::metrics::SyncMetrics;
use crate::names;
use crate::runner::DriverError;
use ahash::AHashSet as HashSet;
use anyhow::{Context, Result};
use netguard_core::{
    LocalPods, NamedPortEndpoints, PodInfo, PolicyInfo, ProtocolPort,
};
use std::time::Instant;
use tracing::{debug, warn};

pub const FILTER: &str = "filter";

/// Traffic reaches pod chains through diversion rules in these chains.
const TOP_LEVEL_CHAINS: [&str; 3] = ["FORWARD", "OUTPUT", "INPUT"];

/// The names produced by one epoch. Anything live under our prefixes but
/// absent from here is stale and gets collected.
#[derive(Debug, Default)]
struct ActiveNames {
    policy_chains: HashSet<String>,
    pod_chains: HashSet<String>,
    sets: HashSet<String>,
}

pub struct FirewallSync<P, S> {
    filter: P,
    sets: S,
    metrics: Option<SyncMetrics>,
}

// === impl FirewallSync ===

impl<P: PacketFilter, S: Ipset> FirewallSync<P, S> {
    pub fn new(filter: P, sets: S, metrics: Option<SyncMetrics>) -> Self {
        Self {
            filter,
            sets,
            metrics,
        }
    }

    pub(crate) fn drivers(&self) -> (&P, &S) {
        (&self.filter, &self.sets)
    }

    /// One full apply pass for `epoch`: per-policy chains, per-pod chains,
    /// then stale-artifact collection.
    pub async fn apply(
        &self,
        model: &[PolicyInfo],
        local: &LocalPods,
        epoch: &str,
    ) -> Result<()> {
        let mut active = ActiveNames::default();

        let start = Instant::now();
        self.sync_policy_chains(model, epoch, &mut active)
            .await
            .context("syncing policy chains")?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_policy_chains(start.elapsed());
        }

        self.sync_pod_chains(model, local, epoch, &mut active)
            .await
            .context("syncing pod firewall chains")?;

        self.collect_stale(&active)
            .await
            .context("cleaning up stale rules")?;

        Ok(())
    }

    async fn sync_policy_chains(
        &self,
        model: &[PolicyInfo],
        epoch: &str,
        active: &mut ActiveNames,
    ) -> Result<(), DriverError> {
        for policy in model {
            let chain = names::policy_chain(&policy.namespace, &policy.name, epoch);
            self.filter.ensure_chain(FILTER, &chain).await?;
            active.policy_chains.insert(chain.clone());

            let target_ips: Vec<SetMember> = policy
                .target_pods
                .keys()
                .map(|ip| SetMember::address(*ip))
                .collect();

            if policy.kind.has_ingress() {
                let target_dst = names::policy_dest_set(&policy.namespace, &policy.name);
                self.ensure_set(&target_dst, SetKind::HashIp, &target_ips, active)
                    .await;
                self.ingress_rules(policy, &chain, &target_dst, active)
                    .await?;
            }

            if policy.kind.has_egress() {
                let target_src = names::policy_source_set(&policy.namespace, &policy.name);
                self.ensure_set(&target_src, SetKind::HashIp, &target_ips, active)
                    .await;
                self.egress_rules(policy, &chain, &target_src, active).await?;
            }
        }

        debug!("policy chains synchronized with the policy model");
        Ok(())
    }

    /// Creates and fills a set, tolerating transient failures: the name is
    /// recorded as active either way (a set left from a previous epoch may
    /// still be referenced), and a `false` return tells the caller to skip
    /// the rules that would match against it.
    async fn ensure_set(
        &self,
        name: &str,
        kind: SetKind,
        members: &[SetMember],
        active: &mut ActiveNames,
    ) -> bool {
        active.sets.insert(name.to_string());
        if let Err(error) = self.sets.create(name, kind).await {
            warn!(%error, name, "failed to create address set");
            return false;
        }
        if let Err(error) = self.sets.refresh(name, kind, members).await {
            warn!(%error, name, "failed to refresh address set");
        }
        true
    }

    async fn ingress_rules(
        &self,
        policy: &PolicyInfo,
        chain: &str,
        target_dst: &str,
        active: &mut ActiveNames,
    ) -> Result<(), DriverError> {
        let ns = &policy.namespace;
        let name = &policy.name;

        for (i, rule) in policy.ingress.iter().enumerate() {
            if !rule.src_pods.is_empty() {
                let comment = format!(
                    "rule to ACCEPT traffic from source pods to dest pods selected by policy name {name} namespace {ns}"
                );
                let src_set = names::indexed_source_pod_set(ns, name, i);
                let members: Vec<SetMember> = rule
                    .src_pods
                    .iter()
                    .map(|pod| SetMember::address(pod.ip))
                    .collect();
                if self.ensure_set(&src_set, SetKind::HashIp, &members, active).await {
                    for port in &rule.ports {
                        self.accept(chain, &comment, Some(&src_set), Some(target_dst), Some(*port))
                            .await?;
                    }
                    for (j, endpoints) in rule.named_ports.iter().enumerate() {
                        let port_set = names::indexed_ingress_named_port_set(ns, name, i, j);
                        self.named_port_accept(chain, &comment, Some(&src_set), &port_set, endpoints, active)
                            .await?;
                    }
                    if rule.ports.is_empty() && rule.named_ports.is_empty() {
                        self.accept(chain, &comment, Some(&src_set), Some(target_dst), None)
                            .await?;
                    }
                }
            }

            if rule.match_all_sources {
                let comment = format!(
                    "rule to ACCEPT traffic from all sources to dest pods selected by policy name: {name} namespace {ns}"
                );
                if rule.match_all_ports {
                    self.accept(chain, &comment, None, Some(target_dst), None).await?;
                } else {
                    for port in &rule.ports {
                        self.accept(chain, &comment, None, Some(target_dst), Some(*port))
                            .await?;
                    }
                    for (j, endpoints) in rule.named_ports.iter().enumerate() {
                        let port_set = names::indexed_ingress_named_port_set(ns, name, i, j);
                        self.named_port_accept(chain, &comment, None, &port_set, endpoints, active)
                            .await?;
                    }
                }
            }

            if !rule.src_blocks.is_empty() {
                let comment = format!(
                    "rule to ACCEPT traffic from specified ipBlocks to dest pods selected by policy name: {name} namespace {ns}"
                );
                let block_set = names::indexed_source_block_set(ns, name, i);
                let members: Vec<SetMember> =
                    rule.src_blocks.iter().map(SetMember::block).collect();
                if self.ensure_set(&block_set, SetKind::HashNet, &members, active).await {
                    if rule.match_all_ports {
                        self.accept(chain, &comment, Some(&block_set), Some(target_dst), None)
                            .await?;
                    } else {
                        for port in &rule.ports {
                            self.accept(
                                chain,
                                &comment,
                                Some(&block_set),
                                Some(target_dst),
                                Some(*port),
                            )
                            .await?;
                        }
                        for (j, endpoints) in rule.named_ports.iter().enumerate() {
                            let port_set = names::indexed_ingress_named_port_set(ns, name, i, j);
                            self.named_port_accept(
                                chain,
                                &comment,
                                Some(&block_set),
                                &port_set,
                                endpoints,
                                active,
                            )
                            .await?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn egress_rules(
        &self,
        policy: &PolicyInfo,
        chain: &str,
        target_src: &str,
        active: &mut ActiveNames,
    ) -> Result<(), DriverError> {
        let ns = &policy.namespace;
        let name = &policy.name;

        for (i, rule) in policy.egress.iter().enumerate() {
            if !rule.dst_pods.is_empty() {
                let comment = format!(
                    "rule to ACCEPT traffic from source pods to dest pods selected by policy name {name} namespace {ns}"
                );
                let dst_set = names::indexed_dest_pod_set(ns, name, i);
                let members: Vec<SetMember> = rule
                    .dst_pods
                    .iter()
                    .map(|pod| SetMember::address(pod.ip))
                    .collect();
                if self.ensure_set(&dst_set, SetKind::HashIp, &members, active).await {
                    for port in &rule.ports {
                        self.accept(chain, &comment, Some(target_src), Some(&dst_set), Some(*port))
                            .await?;
                    }
                    for (j, endpoints) in rule.named_ports.iter().enumerate() {
                        let port_set = names::indexed_egress_named_port_set(ns, name, i, j);
                        self.named_port_accept(
                            chain,
                            &comment,
                            Some(target_src),
                            &port_set,
                            endpoints,
                            active,
                        )
                        .await?;
                    }
                    if rule.ports.is_empty() && rule.named_ports.is_empty() {
                        self.accept(chain, &comment, Some(target_src), Some(&dst_set), None)
                            .await?;
                    }
                }
            }

            if rule.match_all_destinations {
                let comment = format!(
                    "rule to ACCEPT traffic from source pods to all destinations selected by policy name: {name} namespace {ns}"
                );
                if rule.match_all_ports {
                    self.accept(chain, &comment, Some(target_src), None, None).await?;
                } else {
                    for port in &rule.ports {
                        self.accept(chain, &comment, Some(target_src), None, Some(*port))
                            .await?;
                    }
                }
            }

            if !rule.dst_blocks.is_empty() {
                let comment = format!(
                    "rule to ACCEPT traffic from source pods to specified ipBlocks selected by policy name: {name} namespace {ns}"
                );
                let block_set = names::indexed_dest_block_set(ns, name, i);
                let members: Vec<SetMember> =
                    rule.dst_blocks.iter().map(SetMember::block).collect();
                if self.ensure_set(&block_set, SetKind::HashNet, &members, active).await {
                    if rule.match_all_ports {
                        self.accept(chain, &comment, Some(target_src), Some(&block_set), None)
                            .await?;
                    } else {
                        for port in &rule.ports {
                            self.accept(
                                chain,
                                &comment,
                                Some(target_src),
                                Some(&block_set),
                                Some(*port),
                            )
                            .await?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Appends one ACCEPT rule to a policy chain.
    async fn accept(
        &self,
        chain: &str,
        comment: &str,
        src_set: Option<&str>,
        dst_set: Option<&str>,
        port: Option<ProtocolPort>,
    ) -> Result<(), DriverError> {
        let mut rule = Rule::new().comment(comment);
        if let Some(set) = src_set {
            rule = rule.match_set(set, SetDir::Src);
        }
        if let Some(set) = dst_set {
            rule = rule.match_set(set, SetDir::Dst);
        }
        if let Some(port) = port {
            rule = rule.protocol(port.protocol);
            if let Some(number) = port.port {
                rule = rule.dport(number);
            }
        }
        self.filter
            .append_unique(FILTER, chain, &rule.jump("ACCEPT"))
            .await
    }

    /// Materializes one named-port expansion: a dedicated destination set
    /// holding the endpoint addresses, matched at the endpoint's numeric
    /// port.
    async fn named_port_accept(
        &self,
        chain: &str,
        comment: &str,
        src_set: Option<&str>,
        port_set: &str,
        endpoints: &NamedPortEndpoints,
        active: &mut ActiveNames,
    ) -> Result<(), DriverError> {
        let members: Vec<SetMember> = endpoints
            .ips
            .iter()
            .map(|ip| SetMember::address(*ip))
            .collect();
        if !self.ensure_set(port_set, SetKind::HashIp, &members, active).await {
            return Ok(());
        }
        self.accept(
            chain,
            comment,
            src_set,
            Some(port_set),
            Some(ProtocolPort {
                protocol: endpoints.protocol,
                port: Some(endpoints.port),
            }),
        )
        .await
    }

    async fn sync_pod_chains(
        &self,
        model: &[PolicyInfo],
        local: &LocalPods,
        epoch: &str,
        active: &mut ActiveNames,
    ) -> Result<(), DriverError> {
        for (ip, pod) in &local.ingress {
            let chain = self.ensure_pod_chain(pod, model, epoch, active).await?;

            // Same-host deliveries (kubelet health probes) must not be
            // blocked by policy.
            let local_rule = Rule::new()
                .comment("rule to permit the traffic to pods when source is the pod's local node")
                .args(["-m", "addrtype", "--src-type", "LOCAL"])
                .dst(*ip)
                .jump("ACCEPT");
            self.ensure_inserted(FILTER, &chain, &local_rule).await?;

            self.ensure_conntrack(&chain).await?;

            // Divert routed, service-loopback, and bridged traffic for this
            // pod through its chain.
            let comment = format!(
                "rule to jump traffic destined to POD name: {} namespace: {} to chain {chain}",
                pod.name, pod.namespace
            );
            let jump = Rule::new().comment(&comment).dst(*ip).jump(&chain);
            self.ensure_inserted(FILTER, "FORWARD", &jump).await?;
            self.ensure_inserted(FILTER, "OUTPUT", &jump).await?;

            let bridged = Rule::new()
                .args(["-m", "physdev", "--physdev-is-bridged"])
                .comment(&comment)
                .dst(*ip)
                .jump(&chain);
            self.ensure_inserted(FILTER, "FORWARD", &bridged).await?;

            self.finish_pod_chain(&chain, pod).await?;
        }

        for (ip, pod) in &local.egress {
            let chain = self.ensure_pod_chain(pod, model, epoch, active).await?;

            self.ensure_conntrack(&chain).await?;

            let comment = format!(
                "rule to jump traffic from POD name: {} namespace: {} to chain {chain}",
                pod.name, pod.namespace
            );
            let jump = Rule::new().comment(&comment).src(*ip).jump(&chain);
            for top in TOP_LEVEL_CHAINS {
                self.ensure_inserted(FILTER, top, &jump).await?;
            }

            let bridged = Rule::new()
                .args(["-m", "physdev", "--physdev-is-bridged"])
                .comment(&comment)
                .src(*ip)
                .jump(&chain);
            self.ensure_inserted(FILTER, "FORWARD", &bridged).await?;

            self.finish_pod_chain(&chain, pod).await?;
        }

        Ok(())
    }

    /// Creates the pod's chain and wires it through every policy chain
    /// that targets the pod. Jump order among policies is not significant:
    /// any accepting match wins.
    async fn ensure_pod_chain(
        &self,
        pod: &PodInfo,
        model: &[PolicyInfo],
        epoch: &str,
        active: &mut ActiveNames,
    ) -> Result<String, DriverError> {
        let chain = names::pod_firewall_chain(&pod.namespace, &pod.name, epoch);
        self.filter.ensure_chain(FILTER, &chain).await?;
        active.pod_chains.insert(chain.clone());

        for policy in model {
            if policy.target_pods.contains_key(&pod.ip) {
                let policy_chain = names::policy_chain(&policy.namespace, &policy.name, epoch);
                let jump = Rule::new()
                    .comment(format!("run through nw policy {}", policy.name))
                    .jump(&policy_chain);
                self.ensure_inserted(FILTER, &chain, &jump).await?;
            }
        }

        Ok(chain)
    }

    /// Return traffic for connections the pod originated is always allowed.
    async fn ensure_conntrack(&self, chain: &str) -> Result<(), DriverError> {
        let rule = Rule::new()
            .comment("rule for stateful firewall for pod")
            .args(["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"])
            .jump("ACCEPT");
        self.ensure_inserted(FILTER, chain, &rule).await
    }

    /// Terminal rules: log impending drops on NFLOG group 100 (rate
    /// limited), then reject whatever no policy accepted.
    async fn finish_pod_chain(&self, chain: &str, pod: &PodInfo) -> Result<(), DriverError> {
        let log = Rule::new()
            .comment(format!(
                "rule to log dropped traffic POD name: {} namespace: {}",
                pod.name, pod.namespace
            ))
            .jump("NFLOG")
            .args([
                "--nflog-group",
                "100",
                "-m",
                "limit",
                "--limit",
                "10/minute",
                "--limit-burst",
                "10",
            ]);
        self.filter.append_unique(FILTER, chain, &log).await?;

        let reject = Rule::new()
            .comment(format!(
                "default rule to REJECT traffic destined for POD name: {} namespace: {}",
                pod.name, pod.namespace
            ))
            .jump("REJECT");
        self.filter.append_unique(FILTER, chain, &reject).await
    }

    /// The existence-check + insert path: rules land at the head of the
    /// chain so they take effect before the terminal reject.
    async fn ensure_inserted(
        &self,
        table: &str,
        chain: &str,
        rule: &Rule,
    ) -> Result<(), DriverError> {
        if !self.filter.exists(table, chain, rule).await? {
            self.filter.insert(table, chain, 1, rule).await?;
        }
        Ok(())
    }

    /// Sweeps chains and sets under our prefixes that this epoch did not
    /// produce. Pod chains go first (their rules reference policy chains),
    /// and every rule removal is by spec.
    async fn collect_stale(&self, active: &ActiveNames) -> Result<()> {
        let chains = self.filter.list_chains(FILTER).await?;
        let stale_pod_chains: Vec<&String> = chains
            .iter()
            .filter(|c| {
                c.starts_with(names::POD_CHAIN_PREFIX) && !active.pod_chains.contains(*c)
            })
            .collect();
        let stale_policy_chains: Vec<&String> = chains
            .iter()
            .filter(|c| {
                c.starts_with(names::POLICY_CHAIN_PREFIX) && !active.policy_chains.contains(*c)
            })
            .collect();

        for chain in &stale_pod_chains {
            for top in TOP_LEVEL_CHAINS {
                for rule in self.filter.list(FILTER, top).await? {
                    if rule.references(chain) {
                        self.filter.delete(FILTER, top, &rule).await?;
                    }
                }
            }
        }
        for chain in stale_pod_chains {
            debug!(%chain, "removing stale pod firewall chain");
            self.filter.clear_chain(FILTER, chain).await?;
            self.filter.delete_chain(FILTER, chain).await?;
        }

        for chain in stale_policy_chains {
            // Active pod chains should never reference a stale policy
            // chain, but a jump left behind would make the delete fail.
            for pod_chain in &active.pod_chains {
                for rule in self.filter.list(FILTER, pod_chain).await? {
                    if rule.references(chain) {
                        self.filter.delete(FILTER, pod_chain, &rule).await?;
                    }
                }
            }
            debug!(%chain, "removing stale network policy chain");
            self.filter.clear_chain(FILTER, chain).await?;
            self.filter.delete_chain(FILTER, chain).await?;
        }

        let sets = self
            .sets
            .list_sets()
            .await
            .context("enumerating address sets")?;
        for set in sets {
            let owned = set.starts_with(names::SOURCE_SET_PREFIX)
                || set.starts_with(names::DEST_SET_PREFIX);
            if owned && !active.sets.contains(&set) {
                debug!(%set, "destroying stale address set");
                self.sets.destroy(&set).await?;
            }
        }

        Ok(())
    }
}
