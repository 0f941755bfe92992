#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Kubernetes API surface consumed by the agent.
//!
//! Everything the other crates need from `k8s-openapi`/`kube` is re-exported
//! here so they depend on one façade, and the pre-GA policy schema lives in
//! [`legacy`].

pub mod labels;
pub mod legacy;

pub use self::labels::Selector;
pub use k8s_openapi::{
    api::{
        core::v1::{
            Container, ContainerPort, Namespace, Node, NodeAddress, NodeStatus, Pod, PodSpec,
            PodStatus,
        },
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    Client, Error,
};
