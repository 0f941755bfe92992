use anyhow::{anyhow, Context, Result};
use netguard_k8s_api::{Api, Client, Node};
use std::net::Ipv4Addr;

/// Resolves the primary IPv4 address of the node this agent enforces for.
/// Pods whose host address equals it are "local".
pub(crate) async fn local_node_ip(
    client: &Client,
    hostname_override: Option<String>,
) -> Result<Ipv4Addr> {
    let name = match hostname_override {
        Some(name) => name,
        None => std::env::var("HOSTNAME")
            .context("--hostname-override unset and HOSTNAME missing from the environment")?,
    };
    let node = Api::<Node>::all(client.clone())
        .get(&name)
        .await
        .with_context(|| format!("fetching node {name}"))?;
    internal_ip(&node).ok_or_else(|| anyhow!("node {name} has no IPv4 InternalIP address"))
}

fn internal_ip(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .and_then(|addr| addr.address.parse().ok())
}
