//! Service state tracking.
//!
//! Facts about a service arrive piecemeal: the service event carries
//! endpoint mode and networks, container events carry the replicas, and
//! either may come first. A service is *initialized* once its networks are
//! known and, in vip mode, the runtime's IPAM VIPs are present; only
//! initialized services raise events, so downstream consumers (DNS, load
//! balancer) never see half-assembled state.

use crate::docker::types::{ContainerInfo, EndpointMode};
use crate::sync::Event;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Immutable copy of a service's state, as carried by events.
#[derive(Debug, Clone, Default)]
pub struct ServiceSnapshot {
    pub id: String,
    pub name: String,
    pub endpoint_mode: Option<EndpointMode>,
    /// Runtime network IDs.
    pub networks: Vec<String>,
    /// network ID -> VIP reserved by the load balancer.
    pub vips: HashMap<String, Ipv4Addr>,
    /// network ID -> VIP from the runtime's IPAM pass.
    pub ipam_vips: HashMap<String, Ipv4Addr>,
    pub containers: HashMap<String, ContainerInfo>,
}

impl ServiceSnapshot {
    pub fn is_initialized(&self) -> bool {
        if self.id.is_empty() || self.name.is_empty() || self.networks.is_empty() {
            return false;
        }
        match self.endpoint_mode {
            Some(EndpointMode::Dnsrr) => true,
            Some(EndpointMode::Vip) => !self.ipam_vips.is_empty(),
            None => false,
        }
    }
}

/// Events a service raises once initialized.
#[derive(Default)]
pub struct ServiceEvents {
    pub initialized: Event<ServiceSnapshot>,
    pub networks_changed: Event<ServiceSnapshot>,
    pub endpoint_mode_changed: Event<ServiceSnapshot>,
    pub vips_changed: Event<ServiceSnapshot>,
    pub container_added: Event<(ServiceSnapshot, ContainerInfo)>,
    pub container_removed: Event<(ServiceSnapshot, ContainerInfo)>,
}

pub struct Service {
    id: String,
    name: String,
    state: RwLock<State>,
    events: ServiceEvents,
}

#[derive(Default)]
struct State {
    endpoint_mode: Option<EndpointMode>,
    networks: Vec<String>,
    vips: HashMap<String, Ipv4Addr>,
    ipam_vips: HashMap<String, Ipv4Addr>,
    containers: HashMap<String, ContainerInfo>,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            state: RwLock::new(State::default()),
            events: ServiceEvents::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &ServiceEvents {
        &self.events
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let state = self.state.read();
        ServiceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            endpoint_mode: state.endpoint_mode,
            networks: state.networks.clone(),
            vips: state.vips.clone(),
            ipam_vips: state.ipam_vips.clone(),
            containers: state.containers.clone(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_initialized()
    }

    /// Set the attached networks and the runtime's IPAM VIPs. `ipam_vips`
    /// is empty in dnsrr mode.
    pub fn set_networks(&self, networks: Vec<String>, ipam_vips: HashMap<String, Ipv4Addr>) {
        let (was_initialized, changed) = {
            let mut state = self.state.write();
            let was = self.initialized_locked(&state);
            let changed = state.networks != networks || state.ipam_vips != ipam_vips;
            state.networks = networks;
            state.ipam_vips = ipam_vips;
            (was, changed)
        };
        self.raise_lifecycle(was_initialized, changed, &self.events.networks_changed);
    }

    pub fn set_endpoint_mode(&self, mode: EndpointMode) {
        let (was_initialized, changed) = {
            let mut state = self.state.write();
            let was = self.initialized_locked(&state);
            let changed = state.endpoint_mode != Some(mode);
            state.endpoint_mode = Some(mode);
            (was, changed)
        };
        self.raise_lifecycle(was_initialized, changed, &self.events.endpoint_mode_changed);
    }

    /// Record the VIPs the load balancer actually reserved.
    pub fn set_vips(&self, vips: HashMap<String, Ipv4Addr>) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.vips != vips;
            state.vips = vips;
            changed
        };
        let snapshot = self.snapshot();
        if snapshot.is_initialized() && changed {
            self.events.vips_changed.raise(&snapshot);
        }
    }

    pub fn add_container(&self, container: ContainerInfo) {
        {
            let mut state = self.state.write();
            state.containers.insert(container.id.clone(), container.clone());
        }
        let snapshot = self.snapshot();
        if snapshot.is_initialized() {
            self.events.container_added.raise(&(snapshot, container));
        }
    }

    pub fn remove_container(&self, container_id: &str) {
        let removed = {
            let mut state = self.state.write();
            state.containers.remove(container_id)
        };
        if let Some(container) = removed {
            let snapshot = self.snapshot();
            if snapshot.is_initialized() {
                self.events.container_removed.raise(&(snapshot, container));
            }
        }
    }

    fn initialized_locked(&self, state: &State) -> bool {
        if state.networks.is_empty() {
            return false;
        }
        match state.endpoint_mode {
            Some(EndpointMode::Dnsrr) => true,
            Some(EndpointMode::Vip) => !state.ipam_vips.is_empty(),
            None => false,
        }
    }

    fn raise_lifecycle(&self, was_initialized: bool, changed: bool, on_change: &Event<ServiceSnapshot>) {
        let snapshot = self.snapshot();
        if !snapshot.is_initialized() {
            return;
        }
        if !was_initialized {
            self.events.initialized.raise(&snapshot);
        } else if changed {
            on_change.raise(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vip_map(network: &str, ip: &str) -> HashMap<String, Ipv4Addr> {
        HashMap::from([(network.to_string(), ip.parse().unwrap())])
    }

    #[test]
    fn initialization_requires_networks_and_mode() {
        let service = Service::new("s1", "api");
        assert!(!service.is_initialized());

        service.set_endpoint_mode(EndpointMode::Vip);
        assert!(!service.is_initialized());

        service.set_networks(vec!["n1".into()], vip_map("n1", "10.1.0.2"));
        assert!(service.is_initialized());
    }

    #[test]
    fn dnsrr_initializes_without_vips() {
        let service = Service::new("s1", "workers");
        service.set_endpoint_mode(EndpointMode::Dnsrr);
        service.set_networks(vec!["n1".into()], HashMap::new());
        assert!(service.is_initialized());
    }

    #[test]
    fn initialized_fires_exactly_once() {
        let service = Service::new("s1", "api");
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            service.events().initialized.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        service.set_endpoint_mode(EndpointMode::Vip);
        service.set_networks(vec!["n1".into()], vip_map("n1", "10.1.0.2"));
        // Re-applying identical facts must not re-raise.
        service.set_endpoint_mode(EndpointMode::Vip);
        service.set_networks(vec!["n1".into()], vip_map("n1", "10.1.0.2"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn container_events_only_fire_when_initialized() {
        let service = Service::new("s1", "api");
        let added = Arc::new(AtomicUsize::new(0));
        {
            let added = added.clone();
            service.events().container_added.subscribe(move |_| {
                added.fetch_add(1, Ordering::SeqCst);
            });
        }

        service.add_container(ContainerInfo {
            id: "c1".into(),
            name: "api.1".into(),
            ..Default::default()
        });
        assert_eq!(added.load(Ordering::SeqCst), 0);

        service.set_endpoint_mode(EndpointMode::Dnsrr);
        service.set_networks(vec!["n1".into()], HashMap::new());
        service.add_container(ContainerInfo {
            id: "c2".into(),
            name: "api.2".into(),
            ..Default::default()
        });
        assert_eq!(added.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn vips_changed_fires_on_difference_only() {
        let service = Service::new("s1", "api");
        service.set_endpoint_mode(EndpointMode::Vip);
        service.set_networks(vec!["n1".into()], vip_map("n1", "10.1.0.2"));

        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            service.events().vips_changed.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        service.set_vips(vip_map("n1", "10.1.0.3"));
        service.set_vips(vip_map("n1", "10.1.0.3"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
