//! Embedded per-container DNS.
//!
//! Every container attached to one of our networks gets a resolver inside
//! its own network namespace. The runtime's built-in resolver address
//! (127.0.0.11:53) is intercepted with DNAT/SNAT rules and redirected to
//! our listeners on 127.0.0.33, so containers keep their stock resolv.conf.

pub mod redirect;
pub mod resolver;
pub mod server;

pub use resolver::{Resolver, ServiceDnsView};
pub use server::Nameserver;

use std::net::Ipv4Addr;

/// Address our listeners bind inside each sandbox.
pub const DNS_LISTEN_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 33);

/// The runtime's built-in resolver address that gets intercepted.
pub const DOCKER_RESOLVER_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 11);
