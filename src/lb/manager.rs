//! Load-balancer management.
//!
//! Tracks which runtime networks are ours, owns the per-network namespaces
//! and keeps each service's IPVS tables in sync with its replica set.
//! Backend updates are diffed against the last programmed set; the tables
//! are never rebuilt wholesale.

use crate::core::error::{DriverError, Result};
use crate::ipam::ReservationType;
use crate::lb::fwmark::FwmarkAllocator;
use crate::lb::{ipvs, lb_namespace_name};
use crate::network::controller::FlannelNetwork;
use crate::network::netns;
use crate::sync::ConcurrentMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Dummy device inside each LB namespace that carries the VIPs.
const LB_DUMMY_DEVICE: &str = "lb0";

/// The slice of a service the load balancer needs.
#[derive(Debug, Clone, Default)]
pub struct LbService {
    pub id: String,
    pub name: String,
    /// Runtime network IDs the service is attached to.
    pub networks: Vec<String>,
    /// VIP the runtime's IPAM pass picked per network, reused as the
    /// preferred address when the manager reserves the VIP itself.
    pub preferred_vips: HashMap<String, Ipv4Addr>,
    /// Replica addresses per network.
    pub backends: HashMap<String, BTreeSet<Ipv4Addr>>,
}

/// Programmed state of one service on one network.
#[derive(Debug, Clone)]
struct LbNetworkState {
    fwmark: u32,
    vip: Ipv4Addr,
    namespace: String,
    backends: BTreeSet<Ipv4Addr>,
}

#[derive(Default)]
struct ServiceState {
    /// runtime network ID -> programmed state
    per_network: HashMap<String, LbNetworkState>,
}

pub struct ServiceLbManager {
    fwmarks: FwmarkAllocator,
    /// Runtime network ID -> our network controller.
    networks: ConcurrentMap<String, Arc<FlannelNetwork>>,
    /// Runtime network IDs that belong to other drivers; tracked so service
    /// updates can tell "not ours" from "not yet known".
    other_networks: ConcurrentMap<String, ()>,
    services: Mutex<HashMap<String, ServiceState>>,
}

impl ServiceLbManager {
    pub fn new(fwmarks: FwmarkAllocator) -> Self {
        Self {
            fwmarks,
            networks: ConcurrentMap::new(),
            other_networks: ConcurrentMap::new(),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Register one of our networks under its runtime ID.
    pub fn set_flannel_network(&self, docker_network_id: &str, network: Arc<FlannelNetwork>) {
        self.networks
            .insert(docker_network_id.to_string(), network);
    }

    /// Register a network that belongs to another driver, by runtime ID.
    pub fn register_other_network(&self, docker_network_id: &str) {
        self.other_networks
            .insert(docker_network_id.to_string(), ());
    }

    pub fn is_our_network(&self, docker_network_id: &str) -> bool {
        self.networks.contains(&docker_network_id.to_string())
    }

    /// Bring one service's load balancers in line with its current replica
    /// set, creating VIPs, fwmarks, namespaces and IPVS services on demand.
    /// Returns the VIP per network.
    pub async fn create_or_update(&self, service: &LbService) -> Result<HashMap<String, Ipv4Addr>> {
        let mut services = self.services.lock().await;
        let state = services.entry(service.id.clone()).or_default();
        let mut vips = HashMap::new();

        for network_id in &service.networks {
            let Some(network) = self.networks.get(network_id) else {
                if !self.other_networks.contains(network_id) {
                    debug!(service = %service.name, network_id, "network not known yet, skipping");
                }
                continue;
            };

            if !state.per_network.contains_key(network_id) {
                let programmed = self
                    .program_network(service, network_id, &network)
                    .await?;
                state.per_network.insert(network_id.clone(), programmed);
            }

            let programmed = state
                .per_network
                .get_mut(network_id)
                .expect("inserted above");
            vips.insert(network_id.clone(), programmed.vip);

            let desired = service
                .backends
                .get(network_id)
                .cloned()
                .unwrap_or_default();
            Self::update_backends(programmed, &desired).await?;
        }

        Ok(vips)
    }

    /// First-time programming of a service on one network.
    async fn program_network(
        &self,
        service: &LbService,
        network_id: &str,
        network: &Arc<FlannelNetwork>,
    ) -> Result<LbNetworkState> {
        let info = network.info().await.ok_or_else(|| {
            DriverError::external("ipvs", format!("network {network_id} is not ready"))
        })?;
        let pool = network
            .pool()
            .await
            .ok_or_else(|| DriverError::external("ipvs", format!("network {network_id} has no pool")))?;

        let vip = pool
            .allocate_ip(
                service.preferred_vips.get(network_id).copied(),
                None,
                ReservationType::ServiceVip,
                true,
            )
            .await?;
        let fwmark = self.fwmarks.get(&service.id, network_id).await?;

        let namespace = lb_namespace_name(network_id);
        let ns = namespace.clone();
        tokio::task::spawn_blocking(move || netns::create_named(&ns))
            .await
            .map_err(|err| DriverError::external("netns", err.to_string()))??;

        // Dummy device carrying the VIP, then the virtual service itself.
        ipvs::ip(
            &namespace,
            &[
                "link".into(),
                "add".into(),
                LB_DUMMY_DEVICE.into(),
                "mtu".into(),
                info.mtu.to_string(),
                "type".into(),
                "dummy".into(),
            ],
            true,
        )
        .await?;
        ipvs::ip(
            &namespace,
            &[
                "addr".into(),
                "add".into(),
                format!("{vip}/32"),
                "dev".into(),
                LB_DUMMY_DEVICE.into(),
            ],
            true,
        )
        .await?;
        ipvs::ip(
            &namespace,
            &[
                "link".into(),
                "set".into(),
                LB_DUMMY_DEVICE.into(),
                "up".into(),
            ],
            false,
        )
        .await?;

        ipvs::ipvsadm(&namespace, &ipvs::add_service_args(fwmark), true).await?;
        for (table, rule) in ipvs::vip_iptables_rules(vip, fwmark) {
            ipvs::iptables(&namespace, &table, &rule).await?;
        }

        info!(service = %service.name, network_id, %vip, fwmark, "programmed load balancer");
        Ok(LbNetworkState {
            fwmark,
            vip,
            namespace,
            backends: BTreeSet::new(),
        })
    }

    /// Apply only the delta between the programmed and the desired backend
    /// set.
    async fn update_backends(
        state: &mut LbNetworkState,
        desired: &BTreeSet<Ipv4Addr>,
    ) -> Result<()> {
        let current = state.backends.clone();
        let to_add: Vec<Ipv4Addr> = desired.difference(&current).copied().collect();
        let to_remove: Vec<Ipv4Addr> = current.difference(desired).copied().collect();

        for backend in to_add {
            ipvs::ipvsadm(
                &state.namespace,
                &ipvs::add_backend_args(state.fwmark, backend),
                true,
            )
            .await?;
            state.backends.insert(backend);
        }
        for backend in to_remove {
            ipvs::ipvsadm(
                &state.namespace,
                &ipvs::delete_backend_args(state.fwmark, backend),
                true,
            )
            .await?;
            state.backends.remove(&backend);
        }
        Ok(())
    }

    /// Tear one service down everywhere: backends, virtual service, VIP
    /// reservation and fwmark. Best-effort per step.
    pub async fn delete_load_balancer(&self, service_id: &str) -> Result<()> {
        let state = {
            let mut services = self.services.lock().await;
            services.remove(service_id)
        };
        let Some(state) = state else {
            return Ok(());
        };

        for (network_id, programmed) in state.per_network {
            if let Err(err) = ipvs::ipvsadm(
                &programmed.namespace,
                &ipvs::delete_service_args(programmed.fwmark),
                true,
            )
            .await
            {
                warn!(service_id, network_id, error = %err, "failed to delete ipvs service");
            }

            // The dummy device stays (other services may hold VIPs on it);
            // only this service's address leaves.
            if let Err(err) = ipvs::ip(
                &programmed.namespace,
                &[
                    "addr".into(),
                    "del".into(),
                    format!("{}/32", programmed.vip),
                    "dev".into(),
                    LB_DUMMY_DEVICE.into(),
                ],
                true,
            )
            .await
            {
                warn!(service_id, network_id, error = %err, "failed to remove VIP address");
            }

            for (table, mut rule) in ipvs::vip_iptables_rules(programmed.vip, programmed.fwmark) {
                rule[0] = "-D".to_string();
                if let Err(err) = ipvs::iptables(&programmed.namespace, &table, &rule).await {
                    warn!(service_id, network_id, error = %err, "failed to remove VIP mark rule");
                }
            }

            if let Some(network) = self.networks.get(&network_id) {
                if let Some(pool) = network.pool().await {
                    if let Err(err) = pool.release_ip_if_reserved(programmed.vip).await {
                        warn!(service_id, network_id, error = %err, "failed to release VIP");
                    }
                }
            }
            if let Err(err) = self
                .fwmarks
                .release(service_id, &network_id, programmed.fwmark)
                .await
            {
                warn!(service_id, network_id, error = %err, "failed to release fwmark");
            }
        }
        info!(service_id, "load balancer deleted");
        Ok(())
    }

    /// Forget a network: drop per-service state on it, its namespace and
    /// its fwmark entries. Called from the network-removed event.
    pub async fn delete_network(&self, docker_network_id: &str) -> Result<()> {
        self.networks.try_remove(&docker_network_id.to_string());
        self.other_networks
            .try_remove(&docker_network_id.to_string());

        let mut services = self.services.lock().await;
        for state in services.values_mut() {
            state.per_network.remove(docker_network_id);
        }
        drop(services);

        let namespace = lb_namespace_name(docker_network_id);
        tokio::task::spawn_blocking(move || netns::delete_named(&namespace))
            .await
            .map_err(|err| DriverError::external("netns", err.to_string()))??;

        self.fwmarks.drop_network(docker_network_id).await?;
        Ok(())
    }

    /// Startup cleanup: namespaces of unknown networks and fwmark entries
    /// of unknown services are removed. IPVS state dies with its namespace.
    pub async fn cleanup_stale(
        &self,
        known_services: &HashSet<String>,
        known_network_ids: &[String],
    ) -> Result<()> {
        let valid: HashSet<String> = known_network_ids
            .iter()
            .map(|id| lb_namespace_name(id))
            .collect();
        let named = tokio::task::spawn_blocking(netns::list_named)
            .await
            .map_err(|err| DriverError::external("netns", err.to_string()))??;
        for name in named {
            if name.starts_with(crate::lb::LB_NS_PREFIX) && !valid.contains(&name) {
                info!(namespace = %name, "sweeping stale load-balancer namespace");
                let stale = name.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || netns::delete_named(&stale))
                    .await
                    .map_err(|err| DriverError::external("netns", err.to_string()))?
                {
                    warn!(namespace = %name, error = %err, "failed to delete stale namespace");
                }
            }
        }

        self.fwmarks.cleanup_stale(known_services).await?;
        Ok(())
    }
}
