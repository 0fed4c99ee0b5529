//! Global driver state and startup.
//!
//! One [`FlannelDriver`] per host process: it owns the KV sub-clients, the
//! address space, the network controllers, the load-balancer manager, the
//! DNS resolver with its per-sandbox nameservers and the runtime-fact
//! stores. Inbound plugin RPCs are serialized by a driver-level lock; the
//! store callbacks converge everything else asynchronously.

pub mod handlers;

use crate::core::config::{Config, FLANNEL_ENV_DIR, KV_STARTUP_ATTEMPTS, KV_TIMEOUT};
use crate::core::error::{DriverError, Result};
use crate::dns::{Nameserver, Resolver};
use crate::docker::{local_shard_key, DockerData, SharedRuntime};
use crate::ipam::space::AddressSpace;
use crate::ipam::ReservationType;
use crate::kv::{KvClient, SharedKv};
use crate::lb::fwmark::FwmarkAllocator;
use crate::lb::ServiceLbManager;
use crate::network::bridge::sweep_stale_bridges;
use crate::network::controller::{ControllerOptions, FlannelNetwork};
use crate::network::endpoint::VethPair;
use crate::network::netlink::Netlink;
use crate::network::NetworkInfo;
use crate::service::Service;
use crate::sync::{ConcurrentMap, DualKeyMap};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Hook directories for sandbox readiness signaling, present when the
/// runtime-side hook is deployed.
pub const SANDBOXES_DIR: &str = "/flannel-data/sandboxes";
pub const READY_DIR: &str = "/flannel-data/ready";

/// How long startup waits for the runtime facts before continuing in the
/// background (the runtime may still be booting when we are started).
const DOCKER_INIT_WAIT: Duration = Duration::from_secs(5);

/// Prefix-scoped KV clients, one per subsystem.
pub struct KvClients {
    pub root: KvClient,
    pub docker_data: KvClient,
    pub service_lbs: KvClient,
    pub address_space: KvClient,
    pub networks: KvClient,
}

impl KvClients {
    pub fn new(kv: SharedKv, prefix: &str, endpoints: Vec<String>) -> Self {
        let root = KvClient::new(kv, prefix, endpoints);
        Self {
            docker_data: root.sub(&["docker-data"]),
            service_lbs: root.sub(&["service-lbs"]),
            address_space: root.sub(&["address-space"]),
            networks: root.sub(&["networks"]),
            root,
        }
    }
}

pub struct FlannelDriver {
    pub config: Config,
    pub clients: KvClients,
    pub address_space: AddressSpace,
    pub lb: Arc<ServiceLbManager>,
    pub resolver: Arc<Resolver>,
    pub netlink: Netlink,
    pub controller_options: ControllerOptions,

    /// Networks by flannel ID (primary) and runtime network ID (secondary).
    pub(crate) networks: DualKeyMap<String, String, Arc<FlannelNetwork>>,
    pub(crate) services: ConcurrentMap<String, Arc<Service>>,
    pub(crate) nameservers_by_sandbox: ConcurrentMap<String, Arc<Nameserver>>,
    pub(crate) nameservers_by_endpoint: ConcurrentMap<String, Arc<Nameserver>>,
    docker_data: OnceLock<Arc<DockerData>>,

    /// Serializes every inbound plugin RPC.
    rpc_lock: Mutex<()>,
}

impl FlannelDriver {
    /// Wire the driver and converge startup state. Fatal errors here abort
    /// the process: mandatory directories and an initially reachable KV are
    /// hard requirements.
    pub async fn init(config: Config, kv: SharedKv, runtime: SharedRuntime) -> Result<Arc<Self>> {
        std::fs::create_dir_all(FLANNEL_ENV_DIR)?;
        if config.is_hook_available {
            std::fs::create_dir_all(SANDBOXES_DIR)?;
            std::fs::create_dir_all(READY_DIR)?;
        }

        let clients = KvClients::new(kv, &config.etcd_prefix, config.etcd_endpoints.clone());
        clients
            .root
            .wait_until_available(KV_TIMEOUT, KV_STARTUP_ATTEMPTS)
            .await?;

        let address_space = AddressSpace::new(
            clients.address_space.clone(),
            config.available_subnets.clone(),
            config.network_subnet_size,
        );
        let lb = Arc::new(ServiceLbManager::new(FwmarkAllocator::new(
            clients.service_lbs.clone(),
        )));
        let resolver = Arc::new(Resolver::new(config.dns_docker_compatibility_mode));
        let netlink = Netlink::connect()?;

        let controller_options = ControllerOptions {
            flannel_options: config.default_flannel_options.clone(),
            host_subnet_size: config.default_host_subnet_size,
            ..ControllerOptions::default()
        };

        info!(
            pools = config.pool_capacity(),
            addresses_per_host = config.addresses_per_host(),
            "address space configured"
        );

        let driver = Arc::new(Self {
            config,
            clients,
            address_space,
            lb,
            resolver,
            netlink,
            controller_options,
            networks: DualKeyMap::new(),
            services: ConcurrentMap::new(),
            nameservers_by_sandbox: ConcurrentMap::new(),
            nameservers_by_endpoint: ConcurrentMap::new(),
            docker_data: OnceLock::new(),
            rpc_lock: Mutex::new(()),
        });

        let manager = runtime.is_manager_node().await.unwrap_or(false);
        let shard_key = local_shard_key()?;
        let docker_data = DockerData::new(
            &driver.clients.docker_data,
            runtime,
            &shard_key,
            manager,
            handlers::network_handlers(&driver),
            handlers::service_handlers(&driver),
            handlers::container_handlers(&driver),
        );
        driver
            .docker_data
            .set(docker_data.clone())
            .map_err(|_| DriverError::Conflict("driver initialized twice".into()))?;

        // The runtime may still be starting up; give it a bounded head
        // start and let initialization finish in the background otherwise.
        let init_driver = driver.clone();
        let init_data = docker_data.clone();
        let init_task = tokio::spawn(async move {
            if let Err(err) = init_data.init().await {
                warn!(error = %err, "runtime fact initialization failed");
                return;
            }
            init_driver.startup_cleanup().await;
            handlers::inject_nameservers_into_running_containers(&init_driver);
            tokio::spawn(crate::docker::events::run_event_loop(init_data));
        });
        if tokio::time::timeout(DOCKER_INIT_WAIT, init_task).await.is_err() {
            info!("runtime facts not ready yet, continuing initialization in the background");
        }

        Ok(driver)
    }

    pub fn docker_data(&self) -> Option<&Arc<DockerData>> {
        self.docker_data.get()
    }

    /// Hold the driver-level RPC lock for the duration of one request.
    pub async fn rpc_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.rpc_lock.lock().await
    }

    /// Stale-resource sweeps, run once the current runtime facts are known.
    async fn startup_cleanup(&self) {
        let Some(data) = self.docker_data() else { return };

        let networks = data.networks().get_all();
        let known_flannel_ids: Vec<String> = networks
            .values()
            .filter_map(|network| network.flannel_id.clone())
            .collect();
        if let Err(err) = sweep_stale_bridges(&self.netlink, &known_flannel_ids).await {
            warn!(error = %err, "stale bridge sweep failed");
        }

        let known_services: HashSet<String> = data.services().get_all().into_keys().collect();
        let known_network_ids: Vec<String> = networks.keys().cloned().collect();
        if let Err(err) = self
            .lb
            .cleanup_stale(&known_services, &known_network_ids)
            .await
        {
            warn!(error = %err, "stale load-balancer sweep failed");
        }
    }

    pub(crate) fn get_network_by_flannel_id(&self, flannel_id: &str) -> Option<Arc<FlannelNetwork>> {
        self.networks.get_by_primary(&flannel_id.to_string())
    }

    pub(crate) fn get_network_by_docker_id(&self, docker_id: &str) -> Option<Arc<FlannelNetwork>> {
        self.networks.get_by_secondary(&docker_id.to_string())
    }

    /// Look the network up or create it: lease a pool, run the controller
    /// to `Ready`, register with the load balancer under its runtime ID.
    pub async fn get_or_create_network(
        &self,
        docker_network_id: Option<&str>,
        flannel_id: &str,
    ) -> Result<Arc<FlannelNetwork>> {
        if flannel_id.is_empty() {
            return Err(DriverError::InvalidInput(
                "no flannel network ID provided".into(),
            ));
        }

        let network = match self.get_network_by_flannel_id(flannel_id) {
            Some(network) => network,
            None => {
                let pool = self.address_space.get_new_or_existing_pool(flannel_id).await?;
                let vni = self.config.vni_start + self.networks.len() as u32 + 1;
                let network = FlannelNetwork::new(
                    self.clients.networks.sub(&[flannel_id]),
                    self.netlink.clone(),
                    flannel_id,
                    pool,
                    vni,
                    self.controller_options.clone(),
                );
                network.ensure().await?;
                self.networks.insert(
                    flannel_id.to_string(),
                    docker_network_id.map(str::to_string),
                    network.clone(),
                );
                network
            }
        };

        if let Some(docker_id) = docker_network_id.filter(|id| !id.is_empty()) {
            // Attach (or refresh) the runtime-ID index and the LB mapping.
            self.networks.insert(
                flannel_id.to_string(),
                Some(docker_id.to_string()),
                network.clone(),
            );
            self.lb.set_flannel_network(docker_id, network.clone());
        }

        Ok(network)
    }

    // ------------------------------------------------------------------
    // IPAM operations
    // ------------------------------------------------------------------

    /// `RequestPool`: create or look up the network for the flannel ID and
    /// return its cluster-wide CIDR.
    pub async fn request_pool(&self, flannel_id: &str) -> Result<NetworkInfo> {
        let network = self.get_or_create_network(None, flannel_id).await?;
        network
            .info()
            .await
            .ok_or_else(|| DriverError::external("flanneld", "network came up without info"))
    }

    /// `RequestAddress` for the non-gateway case.
    pub async fn request_address(
        &self,
        flannel_id: &str,
        preferred: Option<Ipv4Addr>,
        mac: Option<&str>,
    ) -> Result<(Ipv4Addr, u8)> {
        let network = self
            .get_network_by_flannel_id(flannel_id)
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;
        let info = network
            .info()
            .await
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;
        let pool = network
            .pool()
            .await
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;

        let kind = if preferred.is_some() && mac.is_some() {
            ReservationType::ContainerIp
        } else {
            ReservationType::Reserved
        };
        let ip = pool.allocate_ip(preferred, mac, kind, true).await?;
        Ok((ip, info.host_subnet.prefix_len()))
    }

    /// Gateway address for `RequestAddress` with the gateway option set.
    pub async fn gateway_address(&self, flannel_id: &str) -> Result<Ipv4Addr> {
        let network = self
            .get_network_by_flannel_id(flannel_id)
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;
        let info = network
            .info()
            .await
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;
        Ok(info.local_gateway)
    }

    pub async fn release_address(&self, flannel_id: &str, address: Ipv4Addr) -> Result<()> {
        let network = self
            .get_network_by_flannel_id(flannel_id)
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;
        let pool = network
            .pool()
            .await
            .ok_or_else(|| DriverError::not_found("network", flannel_id))?;
        pool.release_ip(address).await
    }

    // ------------------------------------------------------------------
    // Network-driver operations
    // ------------------------------------------------------------------

    pub async fn create_endpoint(
        &self,
        docker_network_id: &str,
        endpoint_id: &str,
        address: Ipv4Addr,
        mac: &str,
    ) -> Result<()> {
        let network = self
            .get_network_by_docker_id(docker_network_id)
            .ok_or_else(|| DriverError::not_found("network", docker_network_id))?;
        network.add_endpoint(endpoint_id, address, mac);
        Ok(())
    }

    pub async fn endpoint_info(
        &self,
        docker_network_id: &str,
        endpoint_id: &str,
    ) -> Result<(Ipv4Addr, String)> {
        let network = self
            .get_network_by_docker_id(docker_network_id)
            .ok_or_else(|| DriverError::not_found("network", docker_network_id))?;
        let endpoint = network
            .get_endpoint(endpoint_id)
            .ok_or_else(|| DriverError::not_found("endpoint", endpoint_id))?;
        Ok((endpoint.ip(), endpoint.mac().to_string()))
    }

    /// `Join`: materialize the veth pair and wire the sandbox nameserver.
    pub async fn join_endpoint(
        &self,
        docker_network_id: &str,
        endpoint_id: &str,
        sandbox_key: &str,
    ) -> Result<(VethPair, NetworkInfo)> {
        let network = self
            .get_network_by_docker_id(docker_network_id)
            .ok_or_else(|| DriverError::not_found("network", docker_network_id))?;
        let info = network
            .info()
            .await
            .ok_or_else(|| DriverError::not_found("network", docker_network_id))?;

        let pair = network.join_endpoint(endpoint_id).await?;

        if !sandbox_key.is_empty() {
            match handlers::get_or_add_nameserver(self, sandbox_key).await {
                Ok(nameserver) => {
                    nameserver.add_valid_network(docker_network_id);
                    self.nameservers_by_endpoint
                        .insert(endpoint_id.to_string(), nameserver);
                }
                Err(err) => {
                    warn!(sandbox_key, error = %err, "nameserver setup failed for sandbox")
                }
            }
        }

        Ok((pair, info))
    }

    pub async fn leave_endpoint(&self, docker_network_id: &str, endpoint_id: &str) -> Result<()> {
        if let Some(nameserver) = self.nameservers_by_endpoint.try_remove(&endpoint_id.to_string())
        {
            nameserver.remove_valid_network(docker_network_id);
        }
        let network = self
            .get_network_by_docker_id(docker_network_id)
            .ok_or_else(|| DriverError::not_found("network", docker_network_id))?;
        network.leave_endpoint(endpoint_id).await
    }

    /// `DeleteEndpoint`; unknown networks and endpoints succeed.
    pub async fn delete_endpoint(&self, docker_network_id: &str, endpoint_id: &str) -> Result<()> {
        self.nameservers_by_endpoint.try_remove(&endpoint_id.to_string());
        let Some(network) = self.get_network_by_docker_id(docker_network_id) else {
            return Ok(());
        };
        network.delete_endpoint(endpoint_id).await
    }
}
