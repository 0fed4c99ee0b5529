//! Runtime facts materialized into the distributed stores.
//!
//! The JSON field names are the cluster wire format: every host reads every
//! other host's entries, so they are fixed independent of the Rust names.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// How a service exposes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// One virtual IP per network, load-balanced to the replicas.
    Vip,
    /// DNS round robin straight to the replica addresses.
    Dnsrr,
}

/// One container as far as the overlay cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerInfo {
    #[serde(rename = "ContainerID")]
    pub id: String,
    #[serde(rename = "ContainerName")]
    pub name: String,
    #[serde(rename = "ServiceID", default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(rename = "ServiceName", default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Host path of the container's network namespace.
    #[serde(rename = "SandboxKey", default)]
    pub sandbox_key: String,
    /// network ID -> address the container actually uses.
    #[serde(rename = "IPs", default)]
    pub ips: HashMap<String, Ipv4Addr>,
    /// network ID -> address the runtime's IPAM pass picked. May differ
    /// from `ips` when the container landed on another host.
    #[serde(rename = "IpamIPs", default)]
    pub ipam_ips: HashMap<String, Ipv4Addr>,
    /// network ID -> endpoint ID.
    #[serde(rename = "Endpoints", default)]
    pub endpoints: HashMap<String, String>,
    /// network ID -> extra DNS names (aliases).
    #[serde(rename = "DNSNames", default)]
    pub dns_names: HashMap<String, Vec<String>>,
}

/// One service as far as the overlay cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(rename = "ServiceID")]
    pub id: String,
    #[serde(rename = "ServiceName")]
    pub name: String,
    #[serde(rename = "EndpointMode")]
    pub endpoint_mode: EndpointMode,
    /// Runtime network IDs the service is attached to.
    #[serde(rename = "Networks", default)]
    pub networks: Vec<String>,
    /// network ID -> VIP the runtime's IPAM pass picked.
    #[serde(rename = "IpamVIPs", default)]
    pub ipam_vips: HashMap<String, Ipv4Addr>,
}

/// One runtime network, ours or foreign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerNetworkInfo {
    #[serde(rename = "DockerID")]
    pub docker_id: String,
    /// Present only on networks created with our IPAM driver.
    #[serde(rename = "FlannelID", default, skip_serializing_if = "Option::is_none")]
    pub flannel_id: Option<String>,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Subnet", default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

impl DockerNetworkInfo {
    /// Whether this network is one of ours.
    pub fn is_flannel_network(&self) -> bool {
        self.flannel_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_wire_names_are_stable() {
        let container = ContainerInfo {
            id: "c1".into(),
            name: "web.1".into(),
            ips: HashMap::from([("net1".to_string(), "10.1.0.5".parse().unwrap())]),
            ..Default::default()
        };
        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["ContainerID"], "c1");
        assert_eq!(value["ContainerName"], "web.1");
        assert_eq!(value["IPs"]["net1"], "10.1.0.5");
    }

    #[test]
    fn endpoint_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&EndpointMode::Vip).unwrap(), "\"vip\"");
        assert_eq!(
            serde_json::from_str::<EndpointMode>("\"dnsrr\"").unwrap(),
            EndpointMode::Dnsrr
        );
    }

    #[test]
    fn flannel_network_detection_requires_a_nonempty_id() {
        let mut network = DockerNetworkInfo {
            docker_id: "d1".into(),
            flannel_id: None,
            name: "bridge".into(),
            subnet: None,
        };
        assert!(!network.is_flannel_network());
        network.flannel_id = Some(String::new());
        assert!(!network.is_flannel_network());
        network.flannel_id = Some("net1".into());
        assert!(network.is_flannel_network());
    }
}
