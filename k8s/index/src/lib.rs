#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Node-local caches of the cluster objects that drive policy enforcement.
//!
//! Watch tasks feed the [`Index`] through `kubert`'s indexing traits; the
//! reconciler takes point-in-time [`ClusterSnapshot`]s from it and resolves
//! them into the policy model. The index is also the event funnel: every
//! interesting change nudges the reconcile [`Notifier`], which coalesces
//! into at most one pending wake-up. Nudges are dropped until the first
//! full reconcile has succeeded — the initial state is handled by the
//! periodic pass.

mod build;
#[cfg(test)]
mod tests;

pub use self::build::{build_policy_model, local_policy_targets};

use ahash::AHashMap as HashMap;
use netguard_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Which policy schema the apiserver serves. Chosen once at startup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchemaMode {
    Current,
    Legacy,
}

// === impl SchemaMode ===

impl SchemaMode {
    /// Pre-1.7 apiservers only serve the `extensions/v1beta1` schema. The
    /// minor version may carry a vendor suffix (`"28+"`), so non-digits are
    /// stripped before parsing.
    pub fn from_server_version(major: &str, minor: &str) -> Self {
        let minor: u32 = minor
            .chars()
            .filter(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap_or(0);
        if major == "1" && minor < 7 {
            Self::Legacy
        } else {
            Self::Current
        }
    }
}

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the cached cluster state. Owned by the watch tasks; read by the
/// reconciler through snapshots.
#[derive(Debug)]
pub struct Index {
    mode: SchemaMode,
    pods: HashMap<String, HashMap<String, k8s::Pod>>,
    namespaces: HashMap<String, k8s::Namespace>,
    policies: HashMap<String, HashMap<String, k8s::NetworkPolicy>>,
    legacy_policies: HashMap<String, HashMap<String, k8s::legacy::NetworkPolicy>>,
    notify: Notifier,
}

/// A point-in-time copy of the cached cluster state. Object order is
/// (namespace, name) so a reconcile over an unchanged cluster produces an
/// identical model.
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub pods: Vec<k8s::Pod>,
    pub namespaces: Vec<k8s::Namespace>,
    pub policies: Vec<k8s::NetworkPolicy>,
    pub legacy_policies: Vec<k8s::legacy::NetworkPolicy>,
}

/// Wakes the reconciler when cached state changes.
///
/// The channel has capacity one: a nudge while a wake-up is already pending
/// is coalesced away, implementing the "any event → one reconcile" policy.
#[derive(Clone, Debug)]
pub struct Notifier {
    ready: Arc<AtomicBool>,
    tx: mpsc::Sender<()>,
}

// === impl Index ===

impl Index {
    pub fn shared(mode: SchemaMode, notify: Notifier) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            mode,
            pods: HashMap::default(),
            namespaces: HashMap::default(),
            policies: HashMap::default(),
            legacy_policies: HashMap::default(),
            notify,
        }))
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let mut pods: Vec<k8s::Pod> = self
            .pods
            .values()
            .flat_map(|ns| ns.values().cloned())
            .collect();
        pods.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let mut namespaces: Vec<k8s::Namespace> = self.namespaces.values().cloned().collect();
        namespaces.sort_by(|a, b| a.name_any().cmp(&b.name_any()));

        let mut policies: Vec<k8s::NetworkPolicy> = self
            .policies
            .values()
            .flat_map(|ns| ns.values().cloned())
            .collect();
        policies.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let mut legacy_policies: Vec<k8s::legacy::NetworkPolicy> = self
            .legacy_policies
            .values()
            .flat_map(|ns| ns.values().cloned())
            .collect();
        legacy_policies.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        ClusterSnapshot {
            pods,
            namespaces,
            policies,
            legacy_policies,
        }
    }
}

fn sort_key<T: ResourceExt>(resource: &T) -> (String, String) {
    (resource.namespace().unwrap_or_default(), resource.name_any())
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        // Only phase and primary-address changes are interesting; other pod
        // updates churn constantly and never affect the firewall plan.
        let interesting = match self.pods.get(&namespace).and_then(|ns| ns.get(&name)) {
            Some(prev) => pod_phase(prev) != pod_phase(&pod) || pod_ip(prev) != pod_ip(&pod),
            None => true,
        };

        self.pods.entry(namespace).or_default().insert(name, pod);
        if interesting {
            self.notify.nudge();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.pods.get_mut(&namespace) {
            if ns.remove(&name).is_some() {
                if ns.is_empty() {
                    self.pods.remove(&namespace);
                }
                self.notify.nudge();
            }
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, namespace: k8s::Namespace) {
        self.namespaces.insert(namespace.name_any(), namespace);
        // Namespace labels only influence the legacy schema's annotations;
        // in current mode these events never change the plan.
        if self.mode == SchemaMode::Legacy {
            self.notify.nudge();
        }
    }

    fn delete(&mut self, name: String) {
        if self.namespaces.remove(&name).is_some() && self.mode == SchemaMode::Legacy {
            self.notify.nudge();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, policy: k8s::NetworkPolicy) {
        let namespace = policy.namespace().unwrap_or_default();
        self.policies
            .entry(namespace)
            .or_default()
            .insert(policy.name_any(), policy);
        self.notify.nudge();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.policies.get_mut(&namespace) {
            if ns.remove(&name).is_some() {
                if ns.is_empty() {
                    self.policies.remove(&namespace);
                }
                self.notify.nudge();
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::legacy::NetworkPolicy> for Index {
    fn apply(&mut self, policy: k8s::legacy::NetworkPolicy) {
        let namespace = policy.namespace().unwrap_or_default();
        self.legacy_policies
            .entry(namespace)
            .or_default()
            .insert(policy.name_any(), policy);
        self.notify.nudge();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.legacy_policies.get_mut(&namespace) {
            if ns.remove(&name).is_some() {
                if ns.is_empty() {
                    self.legacy_policies.remove(&namespace);
                }
                self.notify.nudge();
            }
        }
    }
}

// === impl Notifier ===

impl Notifier {
    pub fn pair() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let notifier = Self {
            ready: Arc::new(AtomicBool::new(false)),
            tx,
        };
        (notifier, rx)
    }

    /// Marks the initial full sync as complete, enabling change-driven
    /// reconciles.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn nudge(&self) {
        if !self.ready() {
            tracing::trace!("dropping change notification; initial sync incomplete");
            return;
        }
        // A full channel means a reconcile is already pending.
        let _ = self.tx.try_send(());
    }
}

pub(crate) fn pod_ip(pod: &k8s::Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .pod_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
}

pub(crate) fn host_ip(pod: &k8s::Pod) -> Option<&str> {
    pod.status.as_ref()?.host_ip.as_deref()
}

fn pod_phase(pod: &k8s::Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}
