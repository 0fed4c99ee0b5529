//! Name and reverse indices.
//!
//! One resolver per host, shared by every sandbox nameserver. All entries
//! are scoped by runtime network ID; a query only sees the networks its
//! sandbox is attached to. Containers contribute their name and aliases,
//! services contribute their name (VIPs in vip mode, replica addresses in
//! dnsrr mode) and, in docker compatibility mode, `tasks.<name>` always
//! answering with the replica addresses.

use crate::docker::types::ContainerInfo;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

/// The service facts the resolver indexes.
#[derive(Debug, Clone, Default)]
pub struct ServiceDnsView {
    pub id: String,
    pub name: String,
    /// network ID -> VIP (vip mode only).
    pub vips: HashMap<String, Ipv4Addr>,
    /// network ID -> replica addresses.
    pub backends: HashMap<String, BTreeSet<Ipv4Addr>>,
}

/// (name, network, address) triples owned by one container or service,
/// remembered so the owner can be unindexed wholesale.
type Entries = Vec<(String, String, Ipv4Addr)>;

#[derive(Default)]
struct Indices {
    /// name -> network ID -> addresses.
    names: HashMap<String, HashMap<String, BTreeSet<Ipv4Addr>>>,
    /// address -> network ID -> names.
    reverse: HashMap<Ipv4Addr, HashMap<String, BTreeSet<String>>>,
    containers: HashMap<String, Entries>,
    services: HashMap<String, Entries>,
}

impl Indices {
    fn index(&mut self, name: &str, network: &str, ip: Ipv4Addr) {
        self.names
            .entry(name.to_string())
            .or_default()
            .entry(network.to_string())
            .or_default()
            .insert(ip);
        self.reverse
            .entry(ip)
            .or_default()
            .entry(network.to_string())
            .or_default()
            .insert(name.to_string());
    }

    fn unindex(&mut self, name: &str, network: &str, ip: Ipv4Addr) {
        if let Some(by_network) = self.names.get_mut(name) {
            if let Some(ips) = by_network.get_mut(network) {
                ips.remove(&ip);
                if ips.is_empty() {
                    by_network.remove(network);
                }
            }
            if by_network.is_empty() {
                self.names.remove(name);
            }
        }
        if let Some(by_network) = self.reverse.get_mut(&ip) {
            if let Some(names) = by_network.get_mut(network) {
                names.remove(name);
                if names.is_empty() {
                    by_network.remove(network);
                }
            }
            if by_network.is_empty() {
                self.reverse.remove(&ip);
            }
        }
    }

    fn replace_owner(&mut self, owner_entries: Entries, new_entries: Entries) -> Entries {
        for (name, network, ip) in owner_entries {
            self.unindex(&name, &network, ip);
        }
        for (name, network, ip) in &new_entries {
            self.index(name, network, *ip);
        }
        new_entries
    }
}

pub struct Resolver {
    indices: RwLock<Indices>,
    docker_compat: bool,
}

impl Resolver {
    pub fn new(docker_compat: bool) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            docker_compat,
        }
    }

    /// Index a container's name and aliases on every network it has an
    /// address on. Re-adding replaces the previous entries.
    pub fn add_container(&self, container: &ContainerInfo) {
        let mut entries: Entries = Vec::new();
        for (network, ip) in &container.ips {
            entries.push((normalize(&container.name), network.clone(), *ip));
            if let Some(aliases) = container.dns_names.get(network) {
                for alias in aliases {
                    entries.push((normalize(alias), network.clone(), *ip));
                }
            }
        }

        let mut indices = self.indices.write();
        let previous = indices.containers.remove(&container.id).unwrap_or_default();
        let entries = indices.replace_owner(previous, entries);
        indices.containers.insert(container.id.clone(), entries);
    }

    /// Same as [`add_container`](Self::add_container); updates replace.
    pub fn update_container(&self, container: &ContainerInfo) {
        self.add_container(container);
    }

    pub fn remove_container(&self, container_id: &str) {
        let mut indices = self.indices.write();
        if let Some(entries) = indices.containers.remove(container_id) {
            indices.replace_owner(entries, Vec::new());
        }
    }

    /// Index a service. Vip mode answers with the VIPs; dnsrr answers with
    /// the replica addresses; `tasks.<name>` always goes to the replicas
    /// when compatibility mode is on.
    pub fn add_service(&self, view: &ServiceDnsView) {
        let name = normalize(&view.name);
        let mut entries: Entries = Vec::new();

        if view.vips.is_empty() {
            for (network, backends) in &view.backends {
                for ip in backends {
                    entries.push((name.clone(), network.clone(), *ip));
                }
            }
        } else {
            for (network, vip) in &view.vips {
                entries.push((name.clone(), network.clone(), *vip));
            }
        }

        if self.docker_compat {
            let tasks_name = format!("tasks.{name}");
            for (network, backends) in &view.backends {
                for ip in backends {
                    entries.push((tasks_name.clone(), network.clone(), *ip));
                }
            }
        }

        let mut indices = self.indices.write();
        let previous = indices.services.remove(&view.id).unwrap_or_default();
        let entries = indices.replace_owner(previous, entries);
        indices.services.insert(view.id.clone(), entries);
    }

    pub fn remove_service(&self, service_id: &str) {
        let mut indices = self.indices.write();
        if let Some(entries) = indices.services.remove(service_id) {
            indices.replace_owner(entries, Vec::new());
        }
    }

    /// Addresses for `name` visible from the given networks.
    pub fn resolve_name(&self, name: &str, valid_networks: &[String]) -> Vec<Ipv4Addr> {
        let name = normalize(name);
        let indices = self.indices.read();
        let Some(by_network) = indices.names.get(&name) else {
            return Vec::new();
        };
        let mut result: BTreeSet<Ipv4Addr> = BTreeSet::new();
        for network in valid_networks {
            if let Some(ips) = by_network.get(network) {
                result.extend(ips.iter().copied());
            }
        }
        result.into_iter().collect()
    }

    /// Names for `ip` visible from the given networks.
    pub fn resolve_ip(&self, ip: Ipv4Addr, valid_networks: &[String]) -> Vec<String> {
        let indices = self.indices.read();
        let Some(by_network) = indices.reverse.get(&ip) else {
            return Vec::new();
        };
        let mut result: BTreeSet<String> = BTreeSet::new();
        for network in valid_networks {
            if let Some(names) = by_network.get(network) {
                result.extend(names.iter().cloned());
            }
        }
        result.into_iter().collect()
    }
}

/// Queries arrive with a trailing dot and arbitrary case.
fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
