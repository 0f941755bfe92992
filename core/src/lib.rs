#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core model types for the netguard agent.
//!
//! Each reconcile pass resolves the cluster's declarative policy objects
//! against the cached pod and namespace state into a flat sequence of
//! [`PolicyInfo`] records. The firewall planner consumes that sequence and
//! never touches Kubernetes types directly; everything it needs — target
//! addresses, resolved peers, expanded named ports — is already here.

mod network;
pub mod ports;

pub use self::network::{block_entries, NetworkBlock};
pub use self::ports::{NamedPortTable, PortMap, Protocol};
pub use ipnet::Ipv4Net;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;

/// Which directions a policy filters for its target pods.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Ingress,
    Egress,
    Both,
}

impl PolicyKind {
    pub fn has_ingress(&self) -> bool {
        matches!(self, Self::Ingress | Self::Both)
    }

    pub fn has_egress(&self) -> bool {
        matches!(self, Self::Egress | Self::Both)
    }
}

/// A pod as the reconciler needs it: a primary address plus identity.
///
/// Pods without a primary address never make it into the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub ip: Ipv4Addr,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

/// A numeric port match. `port` is `None` when the rule constrains only the
/// protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolPort {
    pub protocol: Protocol,
    pub port: Option<NonZeroU16>,
}

/// One expansion of a named port: the pods (among the relevant set) exposing
/// that name on this particular protocol and numeric port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPortEndpoints {
    pub protocol: Protocol,
    pub port: NonZeroU16,
    pub ips: Vec<Ipv4Addr>,
}

#[derive(Clone, Debug, Default)]
pub struct IngressRule {
    pub match_all_sources: bool,
    pub match_all_ports: bool,
    pub src_pods: Vec<PodInfo>,
    pub src_blocks: Vec<NetworkBlock>,
    pub ports: Vec<ProtocolPort>,
    pub named_ports: Vec<NamedPortEndpoints>,
}

#[derive(Clone, Debug, Default)]
pub struct EgressRule {
    pub match_all_destinations: bool,
    pub match_all_ports: bool,
    pub dst_pods: Vec<PodInfo>,
    pub dst_blocks: Vec<NetworkBlock>,
    pub ports: Vec<ProtocolPort>,
    pub named_ports: Vec<NamedPortEndpoints>,
}

/// One policy resolved against the cluster state.
///
/// Target pods are keyed by primary address: the planner looks pods up by
/// the address it is writing rules for, and the map keeps iteration
/// deterministic within a reconcile.
#[derive(Clone, Debug)]
pub struct PolicyInfo {
    pub name: String,
    pub namespace: String,
    pub kind: PolicyKind,
    pub target_pods: BTreeMap<Ipv4Addr, PodInfo>,
    pub ingress: Vec<IngressRule>,
    pub egress: Vec<EgressRule>,
}

/// The local pods that need enforcement this reconcile, partitioned by
/// direction and keyed by primary address. A pod targeted by both an
/// ingress-kind and an egress-kind policy appears in both maps and shares a
/// single firewall chain.
#[derive(Clone, Debug, Default)]
pub struct LocalPods {
    pub ingress: BTreeMap<Ipv4Addr, PodInfo>,
    pub egress: BTreeMap<Ipv4Addr, PodInfo>,
}
