//! Full teardown: returns the node to its pre-agent state.

use crate::iptables::PacketFilter;
use crate::names;
use crate::sync::{FirewallSync, FILTER};
use crate::Ipset;
use anyhow::{Context, Result};
use tracing::info;

const TOP_LEVEL_CHAINS: [&str; 3] = ["FORWARD", "OUTPUT", "INPUT"];

impl<P: PacketFilter, S: Ipset> FirewallSync<P, S> {
    /// Removes every diversion rule, chain, and address set the agent owns,
    /// regardless of epoch.
    pub async fn teardown(&self) -> Result<()> {
        let (filter, sets) = self.drivers();
        info!("removing all installed chains and address sets");

        // Diversion rules out of the built-in chains first, so pod chains
        // become unreferenced.
        for top in TOP_LEVEL_CHAINS {
            for rule in filter
                .list(FILTER, top)
                .await
                .with_context(|| format!("listing {top} rules"))?
            {
                if rule
                    .tokens()
                    .iter()
                    .any(|t| t.starts_with(names::POD_CHAIN_PREFIX))
                {
                    filter.delete(FILTER, top, &rule).await?;
                }
            }
        }

        // Flush every owned chain before deleting any: pod chains hold
        // jumps into policy chains.
        let owned: Vec<String> = filter
            .list_chains(FILTER)
            .await
            .context("listing chains")?
            .into_iter()
            .filter(|chain| {
                chain.starts_with(names::POD_CHAIN_PREFIX)
                    || chain.starts_with(names::POLICY_CHAIN_PREFIX)
            })
            .collect();
        for chain in &owned {
            filter.clear_chain(FILTER, chain).await?;
        }
        for chain in &owned {
            filter.delete_chain(FILTER, chain).await?;
        }

        for set in sets.list_sets().await.context("enumerating address sets")? {
            if set.starts_with(names::SOURCE_SET_PREFIX) || set.starts_with(names::DEST_SET_PREFIX)
            {
                sets.destroy(&set).await?;
            }
        }

        Ok(())
    }
}
