//! flannel-np - VXLAN overlay network driver plugin.
//!
//! Provides flat L3 networking for containers across a cluster of hosts.
//! Every logical network gets a cluster-wide subnet leased through a
//! strongly-consistent KV store; each host carves out its own sub-subnet,
//! runs a VXLAN daemon for the data path and programs bridges, veth pairs,
//! routes and iptables locally. Services in vip mode get kernel-level
//! (IPVS) virtual-IP load balancing, and every attached container gets an
//! embedded DNS server scoped to the networks it can actually reach.
//!
//! # Module organization
//!
//! - [`core`] - configuration, error taxonomy, telemetry
//! - [`kv`] - coordination-store abstraction (etcd and in-memory backends)
//! - [`sync`] - concurrent maps and the typed event bus
//! - [`store`] - sharded/unsharded distributed stores with change callbacks
//! - [`ipam`] - pool-subnet leasing and per-network address pools
//! - [`network`] - per-network controllers: daemon, bridge, veth, iptables
//! - [`lb`] - IPVS service load balancing with fwmark dispatch
//! - [`dns`] - per-sandbox embedded DNS with resolver interception
//! - [`docker`] - runtime adapter: facts and events
//! - [`service`] - service state assembly and events
//! - [`driver`] - global driver state and callback wiring
//! - [`api`] - plugin RPC dispatcher (IPAM + network driver over UDS)
//! - [`cli`] - command-line entrypoint

pub mod api;
pub mod cli;
pub mod core;
pub mod dns;
pub mod docker;
pub mod driver;
pub mod ipam;
pub mod kv;
pub mod lb;
pub mod network;
pub mod service;
pub mod store;
pub mod sync;
