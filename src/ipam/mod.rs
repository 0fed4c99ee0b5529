//! Cluster-wide IP address management.
//!
//! [`space::AddressSpace`] leases whole pool subnets (one per logical
//! network) out of the operator-configured supernets; [`pool::AddressPool`]
//! hands out individual addresses inside this host's slice of a pool.
//! All coordination happens through preconditioned KV transactions, so any
//! number of hosts may allocate concurrently without double-assignment.

pub mod pool;
pub mod space;
pub mod subnet;

use std::fmt;

/// What an address reservation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationType {
    /// Placeholder reservation, e.g. the gateway or a first-pass IPAM
    /// address with no container attached yet.
    Reserved,
    /// Address bound to a container interface (MAC affinity applies).
    ContainerIp,
    /// Virtual IP owned by a service load balancer.
    ServiceVip,
}

impl ReservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::ContainerIp => "container-ip",
            Self::ServiceVip => "service-vip",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reserved" => Some(Self::Reserved),
            "container-ip" => Some(Self::ContainerIp),
            "service-vip" => Some(Self::ServiceVip),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
