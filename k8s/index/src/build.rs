//! Resolves a [`ClusterSnapshot`] into the policy model.
//!
//! Peer-resolution failures (bad selectors, malformed CIDRs) are logged and
//! the offending peer is skipped; the enclosing policy and the reconcile
//! continue.

use crate::{host_ip, pod_ip, ClusterSnapshot, SchemaMode};
use anyhow::Result;
use netguard_core::{
    block_entries, EgressRule, IngressRule, LocalPods, NamedPortEndpoints, NamedPortTable, PodInfo,
    PolicyInfo, PolicyKind, Protocol, ProtocolPort,
};
use netguard_k8s_api::{self as k8s, IntOrString, ResourceExt, Selector};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;
use tracing::warn;

/// Builds the ordered policy model for this reconcile.
pub fn build_policy_model(snap: &ClusterSnapshot, mode: SchemaMode) -> Result<Vec<PolicyInfo>> {
    match mode {
        SchemaMode::Current => build_current(snap),
        SchemaMode::Legacy => build_legacy(snap),
    }
}

fn build_current(snap: &ClusterSnapshot) -> Result<Vec<PolicyInfo>> {
    let mut model = Vec::with_capacity(snap.policies.len());

    for policy in &snap.policies {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();

        let spec = match policy.spec.as_ref() {
            Some(spec) => spec,
            None => continue,
        };

        let selector = match Selector::try_from(&spec.pod_selector) {
            Ok(selector) => selector,
            Err(error) => {
                warn!(%namespace, %name, %error, "skipping policy with invalid pod selector");
                continue;
            }
        };

        let kind = policy_kind(spec.policy_types.as_deref());

        let mut target_pods = BTreeMap::new();
        let mut ingress_named_ports = NamedPortTable::default();
        for pod in pods_matching(snap, &namespace, &selector) {
            if let Some(info) = pod_info(pod) {
                grab_named_ports(pod, info.ip, &mut ingress_named_ports);
                target_pods.insert(info.ip, info);
            }
        }

        let ingress = spec
            .ingress
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|rule| resolve_ingress_rule(snap, &namespace, rule, &ingress_named_ports))
            .collect();

        let egress = spec
            .egress
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|rule| resolve_egress_rule(snap, &namespace, rule))
            .collect();

        model.push(PolicyInfo {
            name,
            namespace,
            kind,
            target_pods,
            ingress,
            egress,
        });
    }

    Ok(model)
}

fn resolve_ingress_rule(
    snap: &ClusterSnapshot,
    policy_ns: &str,
    rule: &k8s::NetworkPolicyIngressRule,
    named_ports: &NamedPortTable,
) -> IngressRule {
    let mut resolved = IngressRule::default();

    let peers = rule.from.as_deref().unwrap_or_default();
    if peers.is_empty() {
        resolved.match_all_sources = true;
    } else {
        for peer in peers {
            match eval_pod_peer(snap, policy_ns, peer) {
                Ok(pods) => resolved
                    .src_pods
                    .extend(pods.into_iter().filter_map(pod_info)),
                Err(error) => {
                    warn!(namespace = %policy_ns, %error, "skipping unresolvable policy peer");
                }
            }
            resolved.src_blocks.extend(eval_ip_block_peer(peer));
        }
    }

    let ports = rule.ports.as_deref().unwrap_or_default();
    if ports.is_empty() {
        resolved.match_all_ports = true;
    } else {
        (resolved.ports, resolved.named_ports) = resolve_ports(ports, named_ports);
    }

    resolved
}

fn resolve_egress_rule(
    snap: &ClusterSnapshot,
    policy_ns: &str,
    rule: &k8s::NetworkPolicyEgressRule,
) -> EgressRule {
    let mut resolved = EgressRule::default();

    // Named ports on an egress rule resolve against the rule's destination
    // pods, not the policy's target set.
    let mut named_ports = NamedPortTable::default();

    let peers = rule.to.as_deref().unwrap_or_default();
    if peers.is_empty() {
        resolved.match_all_destinations = true;
    } else {
        for peer in peers {
            match eval_pod_peer(snap, policy_ns, peer) {
                Ok(pods) => {
                    for pod in pods {
                        if let Some(info) = pod_info(pod) {
                            grab_named_ports(pod, info.ip, &mut named_ports);
                            resolved.dst_pods.push(info);
                        }
                    }
                }
                Err(error) => {
                    warn!(namespace = %policy_ns, %error, "skipping unresolvable policy peer");
                }
            }
            resolved.dst_blocks.extend(eval_ip_block_peer(peer));
        }
    }

    let ports = rule.ports.as_deref().unwrap_or_default();
    if ports.is_empty() {
        resolved.match_all_ports = true;
    } else {
        (resolved.ports, resolved.named_ports) = resolve_ports(ports, &named_ports);
    }

    resolved
}

/// Resolves the pod half of a peer clause.
///
/// A namespace selector widens the search to every matching namespace,
/// optionally narrowed by the peer's pod selector; a pod selector alone is
/// scoped to the policy's own namespace. CIDR-only peers resolve to no pods.
fn eval_pod_peer<'s>(
    snap: &'s ClusterSnapshot,
    policy_ns: &str,
    peer: &k8s::NetworkPolicyPeer,
) -> Result<Vec<&'s k8s::Pod>> {
    if let Some(ns_selector) = peer.namespace_selector.as_ref() {
        let ns_selector = Selector::try_from(ns_selector)?;
        let pod_selector = peer
            .pod_selector
            .as_ref()
            .map(Selector::try_from)
            .transpose()?
            .unwrap_or_default();

        let mut pods = Vec::new();
        for namespace in namespaces_matching(snap, &ns_selector) {
            pods.extend(pods_matching(snap, &namespace.name_any(), &pod_selector));
        }
        return Ok(pods);
    }

    if let Some(pod_selector) = peer.pod_selector.as_ref() {
        let pod_selector = Selector::try_from(pod_selector)?;
        return Ok(pods_matching(snap, policy_ns, &pod_selector));
    }

    Ok(Vec::new())
}

/// Expands a CIDR-only peer into set entries; selector peers yield nothing.
fn eval_ip_block_peer(peer: &k8s::NetworkPolicyPeer) -> Vec<netguard_core::NetworkBlock> {
    if peer.pod_selector.is_some() || peer.namespace_selector.is_some() {
        return Vec::new();
    }
    let block = match peer.ip_block.as_ref() {
        Some(block) => block,
        None => return Vec::new(),
    };
    match block_entries(&block.cidr, block.except.as_deref().unwrap_or_default()) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(cidr = %block.cidr, %error, "skipping malformed ipBlock peer");
            Vec::new()
        }
    }
}

/// Classifies port entries: numeric ports pass through; named ports expand
/// through the table into one endpoint record per distinct numeric port.
fn resolve_ports(
    ports: &[k8s::NetworkPolicyPort],
    named: &NamedPortTable,
) -> (Vec<ProtocolPort>, Vec<NamedPortEndpoints>) {
    let mut numeric = Vec::new();
    let mut expanded = Vec::new();

    for entry in ports {
        let protocol = parse_protocol(entry.protocol.as_deref());
        match entry.port.as_ref() {
            None => numeric.push(ProtocolPort {
                protocol,
                port: None,
            }),
            Some(IntOrString::Int(port)) => match checked_port(*port) {
                Some(port) => numeric.push(ProtocolPort {
                    protocol,
                    port: Some(port),
                }),
                None => warn!(port, "skipping out-of-range policy port"),
            },
            Some(IntOrString::String(name)) => expanded.extend(named.lookup(name, protocol)),
        }
    }

    (numeric, expanded)
}

fn build_legacy(snap: &ClusterSnapshot) -> Result<Vec<PolicyInfo>> {
    let mut model = Vec::with_capacity(snap.legacy_policies.len());

    for policy in &snap.legacy_policies {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();

        let mut target_pods = BTreeMap::new();
        let mut named_ports = NamedPortTable::default();
        for pod in pods_matching(snap, &namespace, &policy.spec.pod_selector) {
            if let Some(info) = pod_info(pod) {
                grab_named_ports(pod, info.ip, &mut named_ports);
                target_pods.insert(info.ip, info);
            }
        }

        let ingress = policy
            .spec
            .ingress
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|rule| resolve_legacy_rule(snap, &namespace, rule, &named_ports))
            .collect();

        model.push(PolicyInfo {
            name,
            namespace,
            kind: PolicyKind::Ingress,
            target_pods,
            ingress,
            egress: Vec::new(),
        });
    }

    Ok(model)
}

/// The legacy schema resolves pod-selector peers only; it never produces
/// CIDR entries or the match-all flags.
fn resolve_legacy_rule(
    snap: &ClusterSnapshot,
    policy_ns: &str,
    rule: &k8s::legacy::IngressRule,
    named_ports: &NamedPortTable,
) -> IngressRule {
    let mut resolved = IngressRule::default();

    for peer in rule.from.as_deref().unwrap_or_default() {
        if let Some(selector) = peer.pod_selector.as_ref() {
            resolved.src_pods.extend(
                pods_matching(snap, policy_ns, selector)
                    .into_iter()
                    .filter_map(pod_info),
            );
        }
    }

    for entry in rule.ports.as_deref().unwrap_or_default() {
        let protocol = parse_protocol(entry.protocol.as_deref());
        match entry.port.as_ref() {
            None => resolved.ports.push(ProtocolPort {
                protocol,
                port: None,
            }),
            Some(k8s::legacy::PortValue::Number(port)) => match NonZeroU16::new(*port) {
                Some(port) => resolved.ports.push(ProtocolPort {
                    protocol,
                    port: Some(port),
                }),
                None => warn!("skipping zero policy port"),
            },
            Some(k8s::legacy::PortValue::Name(name)) => resolved
                .named_ports
                .extend(named_ports.lookup(name, protocol)),
        }
    }

    resolved
}

/// Partitions the pods scheduled on this node by the direction of the
/// policies targeting them.
pub fn local_policy_targets(
    snap: &ClusterSnapshot,
    model: &[PolicyInfo],
    node_ip: Ipv4Addr,
) -> LocalPods {
    let mut local = LocalPods::default();
    let node_ip = node_ip.to_string();

    for pod in &snap.pods {
        if host_ip(pod) != Some(node_ip.as_str()) {
            continue;
        }
        let info = match pod_info(pod) {
            Some(info) => info,
            None => continue,
        };

        for policy in model {
            if policy.namespace != info.namespace || !policy.target_pods.contains_key(&info.ip) {
                continue;
            }
            if policy.kind.has_ingress() {
                local.ingress.insert(info.ip, info.clone());
            }
            if policy.kind.has_egress() {
                local.egress.insert(info.ip, info.clone());
            }
        }
    }

    local
}

fn policy_kind(types: Option<&[String]>) -> PolicyKind {
    let types = types.unwrap_or_default();
    let ingress = types.iter().any(|t| t == "Ingress");
    let egress = types.iter().any(|t| t == "Egress");
    match (ingress, egress) {
        (true, true) => PolicyKind::Both,
        (false, true) => PolicyKind::Egress,
        // An empty policyTypes list predates the field; those policies are
        // ingress-only.
        _ => PolicyKind::Ingress,
    }
}

fn pods_matching<'s>(
    snap: &'s ClusterSnapshot,
    namespace: &str,
    selector: &Selector,
) -> Vec<&'s k8s::Pod> {
    snap.pods
        .iter()
        .filter(|pod| pod.namespace().as_deref() == Some(namespace))
        .filter(|pod| selector.matches(pod.metadata.labels.as_ref()))
        .collect()
}

fn namespaces_matching<'s>(
    snap: &'s ClusterSnapshot,
    selector: &Selector,
) -> Vec<&'s k8s::Namespace> {
    snap.namespaces
        .iter()
        .filter(|ns| selector.matches(ns.metadata.labels.as_ref()))
        .collect()
}

/// Pods without a parseable primary address are dropped from the model.
fn pod_info(pod: &k8s::Pod) -> Option<PodInfo> {
    let ip = pod_ip(pod)?.parse().ok()?;
    Some(PodInfo {
        ip,
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
    })
}

/// Folds every named container port of `pod` into the expansion table.
fn grab_named_ports(pod: &k8s::Pod, ip: Ipv4Addr, table: &mut NamedPortTable) {
    let spec = match pod.spec.as_ref() {
        Some(spec) => spec,
        None => return,
    };
    for container in &spec.containers {
        for port in container.ports.as_deref().unwrap_or_default() {
            let name = match port.name.as_deref() {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            let number = match checked_port(port.container_port) {
                Some(number) => number,
                None => continue,
            };
            table.record(name, parse_protocol(port.protocol.as_deref()), number, ip);
        }
    }
}

fn parse_protocol(protocol: Option<&str>) -> Protocol {
    protocol
        .and_then(|p| p.parse().ok())
        .unwrap_or(Protocol::Tcp)
}

fn checked_port(port: i32) -> Option<NonZeroU16> {
    u16::try_from(port).ok().and_then(NonZeroU16::new)
}
