//! Per-network data-plane control.
//!
//! One [`controller::FlannelNetwork`] per overlay network on this host. It
//! owns the VXLAN daemon child, the bridge with its route and iptables
//! rules, the address pool for the host subnet and the endpoints attached
//! here. Ownership of kernel objects follows the naming discipline: bridges
//! are `fl-*`, veth legs are `veth<8 hex>`, load-balancer namespaces are
//! `lb_*`. Anything with those names and no owning network is considered
//! stale and swept.

pub mod bridge;
pub mod controller;
pub mod endpoint;
pub mod envfile;
pub mod iptables;
pub mod netlink;
pub mod netns;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Prefix of bridge interfaces owned by this driver.
pub const BRIDGE_PREFIX: &str = "fl-";

/// Interface names are capped at 15 bytes; `fl-` leaves 12 for the id.
const BRIDGE_ID_CHARS: usize = 12;

/// Everything the rest of the system needs to know about one ready network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Cluster-wide network identifier.
    pub flannel_id: String,
    /// Cluster-wide CIDR of the whole network.
    pub network: Ipv4Net,
    /// The slice of `network` owned by this host.
    pub host_subnet: Ipv4Net,
    /// Gateway address on the local bridge.
    pub local_gateway: Ipv4Addr,
    pub mtu: u32,
    /// VXLAN network identifier.
    pub vni: u32,
}

/// Name of the bridge interface for a network.
pub fn bridge_name(flannel_id: &str) -> String {
    let id: String = flannel_id.chars().take(BRIDGE_ID_CHARS).collect();
    format!("{BRIDGE_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_name_is_prefixed_and_bounded() {
        assert_eq!(bridge_name("net1"), "fl-net1");
        let name = bridge_name("0123456789abcdef0123");
        assert_eq!(name, "fl-0123456789ab");
        assert!(name.len() <= 15);
    }
}
