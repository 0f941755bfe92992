//! Derivation of the chain and set names the agent owns.
//!
//! Every name is a fixed prefix plus the first 16 characters of the
//! base32-encoded SHA-256 of its inputs, which keeps names inside the
//! kernel's 31-character limit while remaining deterministic and
//! collision-resistant. Chain names mix in the reconcile epoch; set names
//! do not — sets are long-lived per policy and refreshed in place.

use data_encoding::BASE32;
use sha2::{Digest, Sha256};

/// Per-pod firewall chains.
pub const POD_CHAIN_PREFIX: &str = "KUBE-POD-FW-";
/// Per-policy chains.
pub const POLICY_CHAIN_PREFIX: &str = "KUBE-NWPLCY-";
/// Source-matched address sets.
pub const SOURCE_SET_PREFIX: &str = "KUBE-SRC-";
/// Destination-matched address sets.
pub const DEST_SET_PREFIX: &str = "KUBE-DST-";

fn hashed(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let encoded = BASE32.encode(&hasher.finalize());
    format!("{prefix}{}", &encoded[..16])
}

pub fn pod_firewall_chain(ns: &str, pod: &str, epoch: &str) -> String {
    hashed(POD_CHAIN_PREFIX, &[ns, pod, epoch])
}

pub fn policy_chain(ns: &str, policy: &str, epoch: &str) -> String {
    hashed(POLICY_CHAIN_PREFIX, &[ns, policy, epoch])
}

pub fn policy_source_set(ns: &str, policy: &str) -> String {
    hashed(SOURCE_SET_PREFIX, &[ns, policy])
}

pub fn policy_dest_set(ns: &str, policy: &str) -> String {
    hashed(DEST_SET_PREFIX, &[ns, policy])
}

pub fn indexed_source_pod_set(ns: &str, policy: &str, rule: usize) -> String {
    hashed(
        SOURCE_SET_PREFIX,
        &[ns, policy, "ingressrule", &rule.to_string(), "pod"],
    )
}

pub fn indexed_dest_pod_set(ns: &str, policy: &str, rule: usize) -> String {
    hashed(
        DEST_SET_PREFIX,
        &[ns, policy, "egressrule", &rule.to_string(), "pod"],
    )
}

pub fn indexed_source_block_set(ns: &str, policy: &str, rule: usize) -> String {
    hashed(
        SOURCE_SET_PREFIX,
        &[ns, policy, "ingressrule", &rule.to_string(), "ipblock"],
    )
}

pub fn indexed_dest_block_set(ns: &str, policy: &str, rule: usize) -> String {
    hashed(
        DEST_SET_PREFIX,
        &[ns, policy, "egressrule", &rule.to_string(), "ipblock"],
    )
}

// Named-port sets are destination-matched in both directions.

pub fn indexed_ingress_named_port_set(ns: &str, policy: &str, rule: usize, port: usize) -> String {
    hashed(
        DEST_SET_PREFIX,
        &[
            ns,
            policy,
            "ingressrule",
            &rule.to_string(),
            &port.to_string(),
            "namedport",
        ],
    )
}

pub fn indexed_egress_named_port_set(ns: &str, policy: &str, rule: usize, port: usize) -> String {
    hashed(
        DEST_SET_PREFIX,
        &[
            ns,
            policy,
            "egressrule",
            &rule.to_string(),
            &port.to_string(),
            "namedport",
        ],
    )
}
