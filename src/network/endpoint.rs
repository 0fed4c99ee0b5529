//! Endpoints and their veth plumbing.
//!
//! An endpoint is created with its IP and MAC when the runtime asks for it;
//! the veth pair only materializes on join. The inside leg carries the
//! endpoint MAC and the network MTU and is handed to the runtime to move
//! into the sandbox; the outside leg is attached to the bridge. Deleting the
//! outside leg tears down the pair.

use crate::core::error::{DriverError, Result};
use crate::network::netlink::{parse_mac, Netlink};
use parking_lot::Mutex;
use rand::RngCore;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

const VETH_PREFIX: &str = "veth";
const VETH_SUFFIX_HEX: usize = 8;

/// Both legs of a created veth pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub inside: String,
    pub outside: String,
}

/// `veth` plus eight random hex characters.
pub fn random_veth_name() -> String {
    let mut bytes = [0u8; VETH_SUFFIX_HEX / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{VETH_PREFIX}{}", hex::encode(bytes))
}

/// Host-side representation of one container attachment.
pub struct Endpoint {
    id: String,
    ip: Ipv4Addr,
    mac: String,
    veth: Mutex<Option<VethPair>>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, ip: Ipv4Addr, mac: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            ip,
            mac: mac.into(),
            veth: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn veth(&self) -> Option<VethPair> {
        self.veth.lock().clone()
    }

    /// Create the veth pair and attach the outside leg to the bridge.
    /// Returns the pair; the inside name goes back to the runtime.
    pub async fn join(&self, netlink: &Netlink, bridge_index: u32, mtu: u32) -> Result<VethPair> {
        if let Some(existing) = self.veth() {
            debug!(endpoint = %self.id, "join called with veth already in place");
            return Ok(existing);
        }

        let pair = VethPair {
            inside: random_veth_name(),
            outside: random_veth_name(),
        };
        let mac = parse_mac(&self.mac)?;

        netlink.add_veth(&pair.inside, &pair.outside).await?;

        let inside_index = netlink
            .link_index(&pair.inside)
            .await?
            .ok_or_else(|| DriverError::external("netlink", "inside veth vanished after create"))?;
        let outside_index = netlink
            .link_index(&pair.outside)
            .await?
            .ok_or_else(|| DriverError::external("netlink", "outside veth vanished after create"))?;

        let configure = async {
            netlink.set_mac(inside_index, &mac).await?;
            netlink.set_mtu(inside_index, mtu).await?;
            netlink.set_mtu(outside_index, mtu).await?;
            netlink.set_master(outside_index, bridge_index).await?;
            netlink.set_up(outside_index).await?;
            Ok::<(), DriverError>(())
        };
        if let Err(err) = configure.await {
            // Roll the half-configured pair back so a retry starts clean.
            let _ = netlink.delete_link(outside_index).await;
            return Err(err);
        }

        info!(endpoint = %self.id, inside = %pair.inside, outside = %pair.outside, "endpoint joined");
        *self.veth.lock() = Some(pair.clone());
        Ok(pair)
    }

    /// Delete the outside veth leg; the kernel removes the peer with it.
    /// A pair that is already gone is fine.
    pub async fn leave(&self, netlink: &Netlink) -> Result<()> {
        let Some(pair) = self.veth.lock().take() else {
            return Ok(());
        };
        if let Some(index) = netlink.link_index(&pair.outside).await? {
            netlink.delete_link(index).await?;
        }
        info!(endpoint = %self.id, outside = %pair.outside, "endpoint left");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_are_prefixed_random_hex() {
        let name = random_veth_name();
        assert!(name.starts_with(VETH_PREFIX));
        assert_eq!(name.len(), VETH_PREFIX.len() + VETH_SUFFIX_HEX);
        assert!(name[VETH_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_veth_name(), random_veth_name());
    }

    #[test]
    fn endpoint_exposes_interface_facts() {
        let endpoint = Endpoint::new("ep-1", "10.1.0.5".parse().unwrap(), "02:42:0a:01:00:05");
        assert_eq!(endpoint.id(), "ep-1");
        assert_eq!(endpoint.ip().to_string(), "10.1.0.5");
        assert_eq!(endpoint.mac(), "02:42:0a:01:00:05");
        assert!(endpoint.veth().is_none());
    }
}
