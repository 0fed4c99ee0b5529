//! CIDR helpers shared by the allocators and the KV key layout.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// KV-safe form of a CIDR: `10.1.0.0/20` becomes `10.1.0.0-20`.
pub fn subnet_to_key(subnet: &Ipv4Net) -> String {
    subnet.to_string().replace('/', "-")
}

/// Inverse of [`subnet_to_key`].
pub fn key_to_subnet(key: &str) -> Option<Ipv4Net> {
    key.replace('-', "/").parse().ok()
}

/// All pool subnets of the given prefix length, enumerated in canonical
/// order: supernets in configured order, subnets in address order.
pub fn pool_candidates(supernets: &[Ipv4Net], pool_prefix: u8) -> Vec<Ipv4Net> {
    let mut result = Vec::new();
    for supernet in supernets {
        if let Ok(subnets) = supernet.subnets(pool_prefix) {
            result.extend(subnets);
        }
    }
    result
}

/// Every usable address of a subnet: network and broadcast excluded, the
/// gateway included (it is excluded by reservation, not by enumeration).
pub fn usable_ips(subnet: &Ipv4Net) -> Vec<Ipv4Addr> {
    subnet.hosts().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips() {
        let subnet: Ipv4Net = "10.1.0.0/20".parse().unwrap();
        assert_eq!(subnet_to_key(&subnet), "10.1.0.0-20");
        assert_eq!(key_to_subnet("10.1.0.0-20"), Some(subnet));
        assert_eq!(key_to_subnet("not-a-subnet"), None);
    }

    #[test]
    fn candidates_enumerate_in_canonical_order() {
        let supernets: Vec<Ipv4Net> =
            vec!["10.1.0.0/16".parse().unwrap(), "10.2.0.0/16".parse().unwrap()];
        let candidates = pool_candidates(&supernets, 20);
        assert_eq!(candidates.len(), 32);
        assert_eq!(candidates[0].to_string(), "10.1.0.0/20");
        assert_eq!(candidates[1].to_string(), "10.1.16.0/20");
        assert_eq!(candidates[16].to_string(), "10.2.0.0/20");
    }

    #[test]
    fn usable_ips_exclude_network_and_broadcast() {
        let subnet: Ipv4Net = "10.1.0.0/29".parse().unwrap();
        let ips = usable_ips(&subnet);
        assert_eq!(ips.len(), 6);
        assert_eq!(ips.first().unwrap().to_string(), "10.1.0.1");
        assert_eq!(ips.last().unwrap().to_string(), "10.1.0.6");
    }
}
