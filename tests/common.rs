//! Common test utilities.
//!
//! Shared helpers for integration tests; import with `mod common;`.
//! Everything runs against the in-memory KV backend and a scriptable
//! runtime stub, so no etcd or Docker daemon is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use flannel_np::core::error::Result;
use flannel_np::docker::types::{ContainerInfo, DockerNetworkInfo, ServiceInfo};
use flannel_np::docker::RuntimeApi;
use flannel_np::kv::memory::MemoryKv;
use flannel_np::kv::KvClient;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Root KV client over a fresh in-memory backend.
pub fn memory_client(prefix: &str) -> KvClient {
    KvClient::new(MemoryKv::shared(), prefix, vec!["memory://local".into()])
}

/// Two clients sharing one backend, for concurrent-allocator tests.
pub fn shared_memory_clients(prefix: &str) -> (KvClient, KvClient) {
    let backend = MemoryKv::shared();
    (
        KvClient::new(backend.clone(), prefix, vec!["memory://local".into()]),
        KvClient::new(backend, prefix, vec!["memory://local".into()]),
    )
}

/// Scriptable [`RuntimeApi`] stub.
#[derive(Default)]
pub struct MockRuntime {
    pub networks: Mutex<HashMap<String, DockerNetworkInfo>>,
    pub containers: Mutex<HashMap<String, ContainerInfo>>,
    pub services: Mutex<HashMap<String, ServiceInfo>>,
    pub manager: bool,
}

impl MockRuntime {
    pub fn manager() -> Arc<Self> {
        Arc::new(Self {
            manager: true,
            ..Self::default()
        })
    }

    pub fn with_network(self: Arc<Self>, network: DockerNetworkInfo) -> Arc<Self> {
        self.networks
            .lock()
            .insert(network.docker_id.clone(), network);
        self
    }
}

#[async_trait]
impl RuntimeApi for MockRuntime {
    async fn list_network_ids(&self) -> Result<Vec<String>> {
        Ok(self.networks.lock().keys().cloned().collect())
    }

    async fn inspect_network(&self, network_id: &str) -> Result<Option<DockerNetworkInfo>> {
        Ok(self.networks.lock().get(network_id).cloned())
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        Ok(self.containers.lock().keys().cloned().collect())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        Ok(self.containers.lock().get(container_id).cloned())
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.services.lock().values().cloned().collect())
    }

    async fn inspect_service(&self, service_id: &str) -> Result<Option<ServiceInfo>> {
        Ok(self.services.lock().get(service_id).cloned())
    }

    async fn is_manager_node(&self) -> Result<bool> {
        Ok(self.manager)
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, Result<flannel_np::docker::RuntimeEvent>>> {
        Ok(Box::pin(futures::stream::pending()))
    }
}
