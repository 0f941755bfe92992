//! The pre-GA network policy schema, served under `extensions/v1beta1` by
//! apiservers older than 1.7.
//!
//! The builder for this schema resolves pod-selector peers only; it has no
//! notion of ipBlocks, namespace selectors, or egress.

use crate::labels;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "extensions",
    version = "v1beta1",
    kind = "NetworkPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    pub pod_selector: labels::Selector,
    pub ingress: Option<Vec<IngressRule>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    pub ports: Option<Vec<NetworkPolicyPort>>,
    pub from: Option<Vec<NetworkPolicyPeer>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    pub pod_selector: Option<labels::Selector>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPort {
    pub protocol: Option<String>,
    pub port: Option<PortValue>,
}

/// A port reference: numeric, or the name of a port declared on a container.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Name(String),
}
