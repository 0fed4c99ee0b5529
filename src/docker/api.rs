//! Runtime API seam.
//!
//! The container runtime's RPC surface is a collaborator with a fixed
//! contract, so the adapter works against the [`RuntimeApi`] trait and only
//! the [`DockerRuntime`] implementation knows about the wire client.

use crate::core::error::{DriverError, Result};
use crate::docker::types::{ContainerInfo, DockerNetworkInfo, EndpointMode, ServiceInfo};
use async_trait::async_trait;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// A runtime event, already narrowed to what the adapter acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    NetworkUpdated { network_id: String },
    NetworkRemoved { network_id: String },
    /// A container joined a network; the container gets re-inspected.
    NetworkConnected { container_id: String },
    /// A container left a network; the container gets re-inspected.
    NetworkDisconnected { container_id: String },
    ServiceUpdated { service_id: String },
    ServiceRemoved { service_id: String },
    /// Container died or was destroyed.
    ContainerGone { container_id: String },
}

/// What the adapter needs from the runtime.
#[async_trait]
pub trait RuntimeApi: Send + Sync + 'static {
    async fn list_network_ids(&self) -> Result<Vec<String>>;
    async fn inspect_network(&self, network_id: &str) -> Result<Option<DockerNetworkInfo>>;

    async fn list_container_ids(&self) -> Result<Vec<String>>;
    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerInfo>>;

    async fn list_services(&self) -> Result<Vec<ServiceInfo>>;
    async fn inspect_service(&self, service_id: &str) -> Result<Option<ServiceInfo>>;

    /// Whether this host is a manager node and therefore the writer for the
    /// cluster-level stores.
    async fn is_manager_node(&self) -> Result<bool>;

    /// Open the event stream. Stream errors end the stream; the caller
    /// resubscribes with backoff.
    async fn subscribe_events(&self) -> Result<BoxStream<'static, Result<RuntimeEvent>>>;
}

pub type SharedRuntime = Arc<dyn RuntimeApi>;

/// Production implementation over the local Docker socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<SharedRuntime> {
        let docker = Docker::connect_with_unix_defaults()
            .map_err(|err| DriverError::external("docker", err.to_string()))?;
        Ok(Arc::new(Self { docker }))
    }
}

fn docker_err(err: bollard::errors::Error) -> DriverError {
    DriverError::external("docker", err.to_string())
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn parse_ip(raw: &str) -> Option<Ipv4Addr> {
    // VIP entries come as CIDR (`10.1.0.2/20`), container addresses bare.
    raw.split('/').next()?.parse().ok()
}

#[async_trait]
impl RuntimeApi for DockerRuntime {
    async fn list_network_ids(&self) -> Result<Vec<String>> {
        let networks = self
            .docker
            .list_networks::<String>(None)
            .await
            .map_err(docker_err)?;
        Ok(networks.into_iter().filter_map(|n| n.id).collect())
    }

    async fn inspect_network(&self, network_id: &str) -> Result<Option<DockerNetworkInfo>> {
        let network = match self.docker.inspect_network::<String>(network_id, None).await {
            Ok(network) => network,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(docker_err(err)),
        };

        let ipam = network.ipam.as_ref();
        let flannel_id = ipam
            .and_then(|ipam| ipam.options.as_ref())
            .and_then(|options| options.get("flannel-id"))
            .filter(|id| !id.is_empty())
            .cloned();
        let subnet = ipam
            .and_then(|ipam| ipam.config.as_ref())
            .and_then(|configs| configs.first())
            .and_then(|config| config.subnet.clone());

        Ok(Some(DockerNetworkInfo {
            docker_id: network.id.unwrap_or_else(|| network_id.to_string()),
            flannel_id,
            name: network.name.unwrap_or_default(),
            subnet,
        }))
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers::<String>(None)
            .await
            .map_err(docker_err)?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        let container = match self.docker.inspect_container(container_id, None).await {
            Ok(container) => container,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(docker_err(err)),
        };

        let labels = container
            .config
            .as_ref()
            .and_then(|config| config.labels.clone())
            .unwrap_or_default();
        let service_id = labels
            .get("com.docker.swarm.service.id")
            .filter(|v| !v.is_empty())
            .cloned();
        let service_name = labels
            .get("com.docker.swarm.service.name")
            .filter(|v| !v.is_empty())
            .cloned();

        let name = container
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let mut info = ContainerInfo {
            id: container_id.to_string(),
            name,
            service_id,
            service_name,
            sandbox_key: container
                .network_settings
                .as_ref()
                .and_then(|settings| settings.sandbox_key.clone())
                .unwrap_or_default(),
            ..Default::default()
        };

        let networks = container
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        for (network_name, endpoint) in networks {
            if network_name == "host" {
                continue;
            }
            let Some(network_id) = endpoint.network_id.filter(|id| !id.is_empty()) else {
                continue;
            };
            if let Some(ip) = endpoint.ip_address.as_deref().and_then(parse_ip) {
                info.ips.insert(network_id.clone(), ip);
            } else {
                debug!(container_id, network_id, "container attachment without address");
            }
            if let Some(ipam_ip) = endpoint
                .ipam_config
                .as_ref()
                .and_then(|ipam| ipam.ipv4_address.as_deref())
                .and_then(parse_ip)
            {
                info.ipam_ips.insert(network_id.clone(), ipam_ip);
            }
            if let Some(endpoint_id) = endpoint.endpoint_id.filter(|id| !id.is_empty()) {
                info.endpoints.insert(network_id.clone(), endpoint_id);
            }
            if let Some(aliases) = endpoint.aliases {
                info.dns_names.insert(network_id, aliases);
            }
        }

        Ok(Some(info))
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let services = self
            .docker
            .list_services::<String>(None)
            .await
            .map_err(docker_err)?;
        Ok(services.into_iter().filter_map(convert_service).collect())
    }

    async fn inspect_service(&self, service_id: &str) -> Result<Option<ServiceInfo>> {
        let service = match self.docker.inspect_service(service_id, None).await {
            Ok(service) => service,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(docker_err(err)),
        };
        Ok(convert_service(service))
    }

    async fn is_manager_node(&self) -> Result<bool> {
        let info = self.docker.info().await.map_err(docker_err)?;
        Ok(info
            .swarm
            .and_then(|swarm| swarm.control_available)
            .unwrap_or(false))
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, Result<RuntimeEvent>>> {
        let stream = self
            .docker
            .events::<String>(None)
            .filter_map(|message| async move {
                match message {
                    Ok(message) => convert_event(message).map(Ok),
                    Err(err) => Some(Err(docker_err(err))),
                }
            })
            .boxed();
        Ok(stream)
    }
}

fn convert_service(service: bollard::models::Service) -> Option<ServiceInfo> {
    let id = service.id?;
    let spec = service.spec.unwrap_or_default();
    let name = spec.name.unwrap_or_default();

    let endpoint = service.endpoint.unwrap_or_default();
    let endpoint_mode = match endpoint.spec.as_ref().and_then(|spec| spec.mode) {
        Some(bollard::models::EndpointSpecModeEnum::DNSRR) => EndpointMode::Dnsrr,
        // The runtime default is vip.
        _ => EndpointMode::Vip,
    };

    let mut networks: Vec<String> = spec
        .task_template
        .and_then(|task| task.networks)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|attachment| attachment.target)
        .collect();

    let mut ipam_vips = HashMap::new();
    for vip in endpoint.virtual_ips.unwrap_or_default() {
        let Some(network_id) = vip.network_id.filter(|id| !id.is_empty()) else {
            continue;
        };
        if let Some(addr) = vip.addr.as_deref().and_then(parse_ip) {
            ipam_vips.insert(network_id.clone(), addr);
        }
        if !networks.contains(&network_id) {
            networks.push(network_id);
        }
    }

    Some(ServiceInfo {
        id,
        name,
        endpoint_mode,
        networks,
        ipam_vips,
    })
}

fn convert_event(message: bollard::models::EventMessage) -> Option<RuntimeEvent> {
    use bollard::models::EventMessageTypeEnum;

    let actor = message.actor.unwrap_or_default();
    let actor_id = actor.id.unwrap_or_default();
    let attributes = actor.attributes.unwrap_or_default();
    let action = message.action.as_deref().unwrap_or_default();

    match message.typ {
        Some(EventMessageTypeEnum::NETWORK) => match action {
            "update" => Some(RuntimeEvent::NetworkUpdated {
                network_id: actor_id,
            }),
            "remove" => Some(RuntimeEvent::NetworkRemoved {
                network_id: actor_id,
            }),
            "connect" => Some(RuntimeEvent::NetworkConnected {
                container_id: attributes.get("container")?.clone(),
            }),
            "disconnect" => Some(RuntimeEvent::NetworkDisconnected {
                container_id: attributes.get("container")?.clone(),
            }),
            _ => None,
        },
        Some(EventMessageTypeEnum::CONTAINER) => match action {
            "die" | "destroy" => Some(RuntimeEvent::ContainerGone {
                container_id: actor_id,
            }),
            _ => None,
        },
        Some(EventMessageTypeEnum::SERVICE) => match action {
            "create" | "update" => Some(RuntimeEvent::ServiceUpdated {
                service_id: actor_id,
            }),
            "remove" => Some(RuntimeEvent::ServiceRemoved {
                service_id: actor_id,
            }),
            _ => None,
        },
        _ => None,
    }
}
