//! Bridge interface lifecycle.

use crate::core::error::Result;
use crate::network::iptables::{self, IptablesRule};
use crate::network::netlink::Netlink;
use crate::network::{bridge_name, NetworkInfo, BRIDGE_PREFIX};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{info, warn};

/// The bridge carrying one overlay network on this host, together with its
/// route and iptables rules.
pub struct BridgeInterface {
    name: String,
    info: NetworkInfo,
    netlink: Netlink,
    rules: Vec<IptablesRule>,
    index: Mutex<Option<u32>>,
}

impl BridgeInterface {
    pub fn new(netlink: Netlink, info: NetworkInfo) -> Self {
        let name = bridge_name(&info.flannel_id);
        let rules = iptables::bridge_rules(&name, &info.host_subnet);
        Self {
            name,
            info,
            netlink,
            rules,
            index: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link index, available once `ensure` ran.
    pub fn index(&self) -> Option<u32> {
        *self.index.lock()
    }

    /// Bring the bridge to its target state: interface present and UP with
    /// the patched bridge attributes, the gateway address assigned, the
    /// host-subnet route installed and the iptables rule set applied.
    pub async fn ensure(&self) -> Result<()> {
        let index = self.netlink.ensure_bridge(&self.name, self.info.mtu).await?;
        self.netlink
            .replace_address(
                index,
                self.info.local_gateway,
                self.info.host_subnet.prefix_len(),
            )
            .await?;
        self.netlink
            .ensure_route(self.info.host_subnet, index, self.info.local_gateway)
            .await?;

        let rules = self.rules.clone();
        tokio::task::spawn_blocking(move || iptables::apply_rules(&rules))
            .await
            .map_err(|err| crate::core::error::DriverError::external("iptables", err.to_string()))??;

        *self.index.lock() = Some(index);
        info!(bridge = %self.name, subnet = %self.info.host_subnet, "bridge ready");
        Ok(())
    }

    /// Tear the bridge down: iptables rules, route, then the link itself.
    /// Each step proceeds even when an earlier one failed.
    pub async fn delete(&self) -> Result<()> {
        let rules = self.rules.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || iptables::remove_rules(&rules))
            .await
            .unwrap_or_else(|err| {
                Err(crate::core::error::DriverError::external(
                    "iptables",
                    err.to_string(),
                ))
            })
        {
            warn!(bridge = %self.name, error = %err, "failed to remove iptables rules");
        }

        let index = match self.index() {
            Some(index) => Some(index),
            None => self.netlink.link_index(&self.name).await?,
        };
        if let Some(index) = index {
            if let Err(err) = self
                .netlink
                .delete_route(self.info.host_subnet, index, self.info.local_gateway)
                .await
            {
                warn!(bridge = %self.name, error = %err, "failed to remove route");
            }
            self.netlink.delete_link(index).await?;
        }
        *self.index.lock() = None;
        info!(bridge = %self.name, "bridge deleted");
        Ok(())
    }
}

/// Delete every `fl-*` bridge whose flannel ID is not in the valid set,
/// together with its attached veth legs and its iptables rules. Runs at
/// startup, before any network is ensured.
pub async fn sweep_stale_bridges(netlink: &Netlink, valid_flannel_ids: &[String]) -> Result<()> {
    let valid_names: HashSet<String> = valid_flannel_ids
        .iter()
        .map(|id| bridge_name(id))
        .collect();

    let links = netlink.links().await?;
    for link in &links {
        if !link.name.starts_with(BRIDGE_PREFIX) || valid_names.contains(&link.name) {
            continue;
        }
        info!(bridge = %link.name, "sweeping stale bridge");

        for child in &links {
            if child.master == Some(link.index) {
                if let Err(err) = netlink.delete_link(child.index).await {
                    warn!(veth = %child.name, error = %err, "failed to delete stale veth");
                }
            }
        }
        if let Err(err) = netlink.delete_link(link.index).await {
            warn!(bridge = %link.name, error = %err, "failed to delete stale bridge");
            continue;
        }

        let name = link.name.clone();
        let result = tokio::task::spawn_blocking(move || iptables::scrub_interface_rules(&name))
            .await
            .unwrap_or_else(|err| {
                Err(crate::core::error::DriverError::external(
                    "iptables",
                    err.to_string(),
                ))
            });
        if let Err(err) = result {
            warn!(bridge = %link.name, error = %err, "failed to scrub stale iptables rules");
        }
    }
    Ok(())
}
