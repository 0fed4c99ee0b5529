//! Runtime-fact fan-in.
//!
//! Materializes networks, services and containers from the runtime into the
//! distributed stores. Networks and services are cluster-level unsharded
//! stores written by manager nodes; containers live in a per-host shard
//! keyed by hostname. Repeated identical inspects are absorbed by the
//! stores' equality checks, so event storms do not fan out downstream.

use crate::core::error::{DriverError, Result};
use crate::docker::api::SharedRuntime;
use crate::docker::types::{ContainerInfo, DockerNetworkInfo, ServiceInfo};
use crate::kv::KvClient;
use crate::store::sharded::ShardedStore;
use crate::store::unsharded::{DistributedStore, StoreRole};
use crate::store::{Handlers, ShardHandlers};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DockerData {
    runtime: SharedRuntime,
    role: StoreRole,
    networks: Arc<DistributedStore<DockerNetworkInfo>>,
    services: Arc<DistributedStore<ServiceInfo>>,
    containers: Arc<ShardedStore<ContainerInfo>>,
}

impl DockerData {
    /// Build the three stores under the `docker-data` prefix. `shard_key`
    /// is this host's name; `manager` decides the writer role for the
    /// cluster-level stores.
    pub fn new(
        client: &KvClient,
        runtime: SharedRuntime,
        shard_key: &str,
        manager: bool,
        network_handlers: Handlers<DockerNetworkInfo>,
        service_handlers: Handlers<ServiceInfo>,
        container_handlers: ShardHandlers<ContainerInfo>,
    ) -> Arc<Self> {
        let role = if manager {
            StoreRole::Writer
        } else {
            StoreRole::Reader
        };
        Arc::new(Self {
            runtime,
            role,
            networks: DistributedStore::new(client.sub(&["networks"]), role, network_handlers),
            services: DistributedStore::new(client.sub(&["services"]), role, service_handlers),
            containers: ShardedStore::new(
                client.sub(&["containers"]),
                shard_key,
                container_handlers,
            ),
        })
    }

    /// Seed every store from the runtime's current state and start the
    /// watches. Callbacks fire from here on.
    pub async fn init(&self) -> Result<()> {
        match self.role {
            StoreRole::Writer => {
                info!("initializing runtime facts as writer");
                let networks = self.fetch_networks().await?;
                self.networks.clone().init(Some(networks)).await?;
                let services = self.fetch_services().await?;
                self.services.clone().init(Some(services)).await?;
            }
            StoreRole::Reader => {
                info!("initializing runtime facts as reader");
                self.networks.clone().init(None).await?;
                self.services.clone().init(None).await?;
            }
        }

        let containers = self.fetch_containers().await?;
        self.containers.clone().init(containers).await?;
        Ok(())
    }

    pub fn networks(&self) -> &Arc<DistributedStore<DockerNetworkInfo>> {
        &self.networks
    }

    pub fn services(&self) -> &Arc<DistributedStore<ServiceInfo>> {
        &self.services
    }

    pub fn containers(&self) -> &Arc<ShardedStore<ContainerInfo>> {
        &self.containers
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Re-inspect one network and store the result.
    pub async fn handle_network(&self, network_id: &str) -> Result<()> {
        match self.runtime.inspect_network(network_id).await? {
            Some(info) => self.networks.add_or_update(network_id, info).await,
            None => {
                debug!(network_id, "network vanished before inspect");
                self.networks.delete(network_id).await
            }
        }
    }

    pub async fn handle_deleted_network(&self, network_id: &str) -> Result<()> {
        self.networks.delete(network_id).await
    }

    /// Re-inspect one container. Containers without any network address
    /// are of no interest and are not stored; a container that is gone is
    /// removed.
    pub async fn handle_container(&self, container_id: &str) -> Result<()> {
        match self.runtime.inspect_container(container_id).await? {
            Some(info) if !info.ips.is_empty() => {
                self.containers.add_or_update(container_id, info).await
            }
            Some(_) => Ok(()),
            None => self.containers.delete(container_id).await,
        }
    }

    pub async fn handle_deleted_container(&self, container_id: &str) -> Result<()> {
        self.containers.delete(container_id).await
    }

    pub async fn handle_service(&self, service_id: &str) -> Result<()> {
        match self.runtime.inspect_service(service_id).await? {
            Some(info) => self.services.add_or_update(service_id, info).await,
            None => {
                debug!(service_id, "service vanished before inspect");
                self.services.delete(service_id).await
            }
        }
    }

    pub async fn handle_deleted_service(&self, service_id: &str) -> Result<()> {
        self.services.delete(service_id).await
    }

    /// Full re-sync of the container shard, used after event-stream gaps.
    pub async fn sync_containers(&self) -> Result<()> {
        let containers = self.fetch_containers().await?;
        self.containers.sync(containers).await
    }

    async fn fetch_networks(&self) -> Result<HashMap<String, DockerNetworkInfo>> {
        let mut result = HashMap::new();
        for network_id in self.runtime.list_network_ids().await? {
            match self.runtime.inspect_network(&network_id).await {
                Ok(Some(info)) => {
                    result.insert(network_id, info);
                }
                Ok(None) => {}
                Err(err) => debug!(network_id, error = %err, "network inspect failed, skipping"),
            }
        }
        Ok(result)
    }

    async fn fetch_services(&self) -> Result<HashMap<String, ServiceInfo>> {
        Ok(self
            .runtime
            .list_services()
            .await?
            .into_iter()
            .map(|service| (service.id.clone(), service))
            .collect())
    }

    async fn fetch_containers(&self) -> Result<HashMap<String, ContainerInfo>> {
        let mut result = HashMap::new();
        for container_id in self.runtime.list_container_ids().await? {
            match self.runtime.inspect_container(&container_id).await {
                Ok(Some(info)) if !info.ips.is_empty() => {
                    result.insert(container_id, info);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(container_id, error = %err, "container inspect failed, skipping")
                }
            }
        }
        Ok(result)
    }
}

/// Local hostname, the shard key for the container store.
pub fn local_shard_key() -> Result<String> {
    let hostname = nix::unistd::gethostname()
        .map_err(|err| DriverError::external("hostname", err.to_string()))?;
    Ok(hostname.to_string_lossy().into_owned())
}
