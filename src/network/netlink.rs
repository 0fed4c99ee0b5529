//! Netlink operations.
//!
//! One shared rtnetlink handle per process; every mutation here only ever
//! touches interfaces the driver owns by naming convention (`fl-*` bridges,
//! `veth*` legs, the dummy devices inside `lb_*` namespaces).

use crate::core::error::{DriverError, Result};
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::link::nlas::{Info, InfoBridge, InfoData, InfoKind, Nla};
use netlink_packet_route::{
    AddressMessage, RouteMessage, AF_INET, RTPROT_KERNEL, RT_SCOPE_LINK, RT_TABLE_MAIN,
};
use rtnetlink::Handle;
use std::net::Ipv4Addr;

/// Bridge ageing is disabled so FDB entries never expire; the forward mask
/// lets the bridge pass link-local multicast the overlay needs.
const BRIDGE_AGEING_TIME: u32 = 0;
const BRIDGE_GROUP_FWD_MASK: u16 = 0xfff8;

/// Minimal view of one interface, enough for the stale sweep.
#[derive(Debug, Clone)]
pub struct LinkBrief {
    pub index: u32,
    pub name: String,
    pub master: Option<u32>,
}

#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

fn external(err: rtnetlink::Error) -> DriverError {
    DriverError::external("netlink", err.to_string())
}

fn already_exists(err: &rtnetlink::Error) -> bool {
    err.to_string().contains("File exists")
}

impl Netlink {
    /// Open the rtnetlink socket and drive it from a background task.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            // rtnetlink reports a missing name as an error response.
            Err(_) => Ok(None),
        }
    }

    /// All interfaces with name and master index.
    pub async fn links(&self) -> Result<Vec<LinkBrief>> {
        let mut stream = self.handle.link().get().execute();
        let mut result = Vec::new();
        while let Some(link) = stream.try_next().await.map_err(external)? {
            let mut name = None;
            let mut master = None;
            for nla in &link.nlas {
                match nla {
                    Nla::IfName(ifname) => name = Some(ifname.clone()),
                    Nla::Master(index) => master = Some(*index),
                    _ => {}
                }
            }
            if let Some(name) = name {
                result.push(LinkBrief {
                    index: link.header.index,
                    name,
                    master,
                });
            }
        }
        Ok(result)
    }

    /// Create the bridge if missing, with ageing disabled and the group
    /// forward mask opened, and bring it up. Returns the link index.
    pub async fn ensure_bridge(&self, name: &str, mtu: u32) -> Result<u32> {
        if self.link_index(name).await?.is_none() {
            let mut request = self.handle.link().add();
            let message = request.message_mut();
            message.nlas.push(Nla::IfName(name.to_string()));
            message.nlas.push(Nla::Mtu(mtu));
            message.nlas.push(Nla::Info(vec![
                Info::Kind(InfoKind::Bridge),
                Info::Data(InfoData::Bridge(vec![
                    InfoBridge::AgeingTime(BRIDGE_AGEING_TIME),
                    InfoBridge::GroupFwdMask(BRIDGE_GROUP_FWD_MASK),
                ])),
            ]));
            if let Err(err) = request.execute().await {
                if !already_exists(&err) {
                    return Err(external(err));
                }
            }
        }

        let index = self
            .link_index(name)
            .await?
            .ok_or_else(|| DriverError::external("netlink", format!("bridge {name} vanished")))?;
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .up()
            .execute()
            .await
            .map_err(external)?;
        Ok(index)
    }

    /// Make `gateway/<prefix>` the only IPv4 address of the interface.
    pub async fn replace_address(&self, index: u32, gateway: Ipv4Addr, prefix: u8) -> Result<()> {
        let mut existing = self.handle.address().get().execute();
        let mut keep = false;
        let mut stale: Vec<AddressMessage> = Vec::new();
        while let Some(address) = existing.try_next().await.map_err(external)? {
            if address.header.index != index {
                continue;
            }
            let matches = address.header.prefix_len == prefix
                && address.nlas.iter().any(|nla| {
                    matches!(netlink_address_bytes(nla), Some(bytes) if bytes == gateway.octets())
                });
            if matches {
                keep = true;
            } else {
                stale.push(address);
            }
        }

        for address in stale {
            if let Err(err) = self.handle.address().del(address).execute().await {
                tracing::warn!(error = %err, "failed to remove stale address");
            }
        }
        if !keep {
            if let Err(err) = self
                .handle
                .address()
                .add(index, gateway.into(), prefix)
                .execute()
                .await
            {
                if !already_exists(&err) {
                    return Err(external(err));
                }
            }
        }
        Ok(())
    }

    /// Install the host-subnet route: `dst dev <link> src <gateway> scope
    /// link proto kernel`, replacing a pre-existing one.
    pub async fn ensure_route(&self, dst: Ipv4Net, index: u32, gateway: Ipv4Addr) -> Result<()> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.addr(), dst.prefix_len())
            .output_interface(index)
            .pref_source(gateway);
        {
            let message = request.message_mut();
            message.header.scope = RT_SCOPE_LINK;
            message.header.protocol = RTPROT_KERNEL;
        }
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(err) if already_exists(&err) => {
                let mut replace = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(dst.addr(), dst.prefix_len())
                    .output_interface(index)
                    .pref_source(gateway)
                    .replace();
                {
                    let message = replace.message_mut();
                    message.header.scope = RT_SCOPE_LINK;
                    message.header.protocol = RTPROT_KERNEL;
                }
                replace.execute().await.map_err(external)
            }
            Err(err) => Err(external(err)),
        }
    }

    /// Remove the host-subnet route. Missing routes are fine.
    pub async fn delete_route(&self, dst: Ipv4Net, index: u32, gateway: Ipv4Addr) -> Result<()> {
        let mut message = RouteMessage::default();
        message.header.address_family = AF_INET as u8;
        message.header.destination_prefix_length = dst.prefix_len();
        message.header.table = RT_TABLE_MAIN;
        message.header.scope = RT_SCOPE_LINK;
        message.header.protocol = RTPROT_KERNEL;
        message.nlas.push(netlink_packet_route::route::Nla::Destination(
            dst.addr().octets().to_vec(),
        ));
        message
            .nlas
            .push(netlink_packet_route::route::Nla::Oif(index));
        message
            .nlas
            .push(netlink_packet_route::route::Nla::PrefSource(
                gateway.octets().to_vec(),
            ));

        if let Err(err) = self.handle.route().del(message).execute().await {
            tracing::debug!(error = %err, dst = %dst, "route delete failed");
        }
        Ok(())
    }

    /// Create a veth pair; both legs stay down until configured.
    pub async fn add_veth(&self, inside: &str, outside: &str) -> Result<()> {
        self.handle
            .link()
            .add()
            .veth(inside.to_string(), outside.to_string())
            .execute()
            .await
            .map_err(external)
    }

    pub async fn set_mac(&self, index: u32, mac: &[u8; 6]) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(external)
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(external)
    }

    /// Attach the interface to a bridge.
    pub async fn set_master(&self, index: u32, bridge_index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .master(bridge_index)
            .execute()
            .await
            .map_err(external)
    }

    pub async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(external)
    }

    /// Delete a link by index. Deleting a veth leg removes its peer too.
    pub async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(external)
    }
}

fn netlink_address_bytes(nla: &netlink_packet_route::address::Nla) -> Option<[u8; 4]> {
    match nla {
        netlink_packet_route::address::Nla::Address(bytes) => bytes.as_slice().try_into().ok(),
        _ => None,
    }
}

/// Parse a colon-separated MAC string into bytes.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(DriverError::InvalidInput(format!("bad MAC address {mac:?}")));
    }
    let mut bytes = [0u8; 6];
    for (slot, part) in bytes.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| DriverError::InvalidInput(format!("bad MAC address {mac:?}")))?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_canonical_form() {
        assert_eq!(
            parse_mac("02:42:0a:01:00:05").unwrap(),
            [0x02, 0x42, 0x0a, 0x01, 0x00, 0x05]
        );
    }

    #[test]
    fn parse_mac_rejects_garbage() {
        assert!(parse_mac("not-a-mac").is_err());
        assert!(parse_mac("02:42:0a:01:00").is_err());
        assert!(parse_mac("02:42:0a:01:00:zz").is_err());
    }
}
