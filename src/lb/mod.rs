//! Service virtual-IP load balancing.
//!
//! Services in `vip` endpoint mode get one virtual IP per attached network
//! and one fwmark per `(service, network)` pair. Traffic to a VIP is marked
//! in a dedicated per-network namespace and dispatched by IPVS to the
//! service's replica backends.

pub mod fwmark;
pub mod ipvs;
pub mod manager;

pub use manager::{LbService, ServiceLbManager};

/// Load-balancer namespaces are named after the runtime network ID.
const LB_NS_PREFIX: &str = "lb_";
const LB_NS_ID_CHARS: usize = 10;

/// Namespace name for a network's load balancers.
pub fn lb_namespace_name(docker_network_id: &str) -> String {
    let id: String = docker_network_id.chars().take(LB_NS_ID_CHARS).collect();
    format!("{LB_NS_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_name_truncates_the_network_id() {
        assert_eq!(lb_namespace_name("abcdef"), "lb_abcdef");
        assert_eq!(
            lb_namespace_name("0123456789abcdef"),
            "lb_0123456789"
        );
    }
}
