//! Store-callback wiring.
//!
//! The distributed stores call back synchronously; everything here clones
//! the payload and hands off to spawned tasks, so store locks and watch
//! loops never wait on the data plane.

use crate::core::error::Result;
use crate::dns::{Nameserver, ServiceDnsView};
use crate::docker::types::{ContainerInfo, DockerNetworkInfo, EndpointMode, ServiceInfo};
use crate::driver::FlannelDriver;
use crate::lb::LbService;
use crate::service::{Service, ServiceSnapshot};
use crate::store::{Handlers, ShardHandlers};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The driver container mounts the host filesystem under this prefix;
/// sandbox paths from the runtime are host paths.
const HOSTFS_PREFIX: &str = "/hostfs";

pub fn network_handlers(driver: &Arc<FlannelDriver>) -> Handlers<DockerNetworkInfo> {
    let added = driver.clone();
    let changed = driver.clone();
    let removed = driver.clone();
    Handlers::new()
        .on_added(move |items: &[crate::store::Item<DockerNetworkInfo>]| {
            for item in items {
                spawn_network_update(&added, item.value.clone());
            }
        })
        .on_changed(move |items| {
            for item in items {
                spawn_network_update(&changed, item.current.clone());
            }
        })
        .on_removed(move |items| {
            for item in items {
                let driver = removed.clone();
                let network = item.value.clone();
                tokio::spawn(async move {
                    handle_network_removed(driver, network).await;
                });
            }
        })
}

fn spawn_network_update(driver: &Arc<FlannelDriver>, network: DockerNetworkInfo) {
    let driver = driver.clone();
    tokio::spawn(async move {
        if network.is_flannel_network() {
            let flannel_id = network.flannel_id.as_deref().unwrap_or_default();
            info!(docker_id = %network.docker_id, flannel_id, "handling network update");
            if let Err(err) = driver
                .get_or_create_network(Some(&network.docker_id), flannel_id)
                .await
            {
                warn!(docker_id = %network.docker_id, flannel_id, error = %err,
                      "failed to converge network");
            }
        } else {
            // Foreign networks are tracked by runtime ID so service updates
            // can tell them apart from not-yet-known ones.
            driver.lb.register_other_network(&network.docker_id);
        }
    });
}

async fn handle_network_removed(driver: Arc<FlannelDriver>, network: DockerNetworkInfo) {
    info!(docker_id = %network.docker_id, "handling network removal");
    if let Err(err) = driver.lb.delete_network(&network.docker_id).await {
        warn!(docker_id = %network.docker_id, error = %err, "load-balancer cleanup failed");
    }

    let Some(flannel_id) = network.flannel_id.filter(|id| !id.is_empty()) else {
        return;
    };
    if let Some(controller) = driver.get_network_by_flannel_id(&flannel_id) {
        if let Err(err) = controller.delete().await {
            warn!(flannel_id, error = %err, "network teardown failed");
        }
    }
    // The pool lease is released here, on the network-removed event, not in
    // the IPAM ReleasePool call.
    if let Err(err) = driver.address_space.release_pool(&flannel_id).await {
        warn!(flannel_id, error = %err, "pool lease release failed");
    }
    driver.networks.remove_by_primary(&flannel_id);
}

pub fn service_handlers(driver: &Arc<FlannelDriver>) -> Handlers<ServiceInfo> {
    let upsert = driver.clone();
    let changed = driver.clone();
    let removed = driver.clone();
    Handlers::new()
        .on_added(move |items| {
            for item in items {
                apply_service_facts(&upsert, &item.value);
            }
        })
        .on_changed(move |items| {
            for item in items {
                apply_service_facts(&changed, &item.current);
            }
        })
        .on_removed(move |items| {
            for item in items {
                let driver = removed.clone();
                let service = item.value.clone();
                tokio::spawn(async move {
                    info!(service_id = %service.id, name = %service.name, "handling service removal");
                    if driver.services.try_remove(&service.id).is_some() {
                        if service.endpoint_mode == EndpointMode::Vip {
                            if let Err(err) = driver.lb.delete_load_balancer(&service.id).await {
                                warn!(service_id = %service.id, error = %err,
                                      "load-balancer teardown failed");
                            }
                        }
                        driver.resolver.remove_service(&service.id);
                    } else {
                        debug!(service_id = %service.id, "remove event for unknown service");
                    }
                });
            }
        })
}

/// Apply a service's mode and networks; both setters raise events only on
/// actual change, which keeps repeated inspects quiet.
fn apply_service_facts(driver: &Arc<FlannelDriver>, info: &ServiceInfo) {
    let service = get_or_create_service(driver, &info.id, &info.name);
    service.set_endpoint_mode(info.endpoint_mode);
    service.set_networks(info.networks.clone(), info.ipam_vips.clone());
}

pub fn container_handlers(driver: &Arc<FlannelDriver>) -> ShardHandlers<ContainerInfo> {
    let added = driver.clone();
    let changed = driver.clone();
    let removed = driver.clone();
    ShardHandlers::new()
        .on_added(move |items: &[crate::store::ShardItem<ContainerInfo>]| {
            for item in items {
                let driver = added.clone();
                let container = item.value.clone();
                tokio::spawn(async move {
                    handle_container_added(driver, container).await;
                });
            }
        })
        .on_changed(move |items| {
            for item in items {
                handle_container_changed(&changed, &item.previous, &item.current);
            }
        })
        .on_removed(move |items| {
            for item in items {
                let driver = removed.clone();
                let container = item.value.clone();
                tokio::spawn(async move {
                    handle_container_removed(driver, container).await;
                });
            }
        })
}

async fn handle_container_added(driver: Arc<FlannelDriver>, container: ContainerInfo) {
    debug!(container_id = %container.id, name = %container.name, "handling container");
    driver.resolver.add_container(&container);

    // The IPAM pass may have reserved an address on a different host than
    // the one the container finally landed on; that reservation is stale
    // the moment the real address differs.
    for (docker_network_id, ipam_ip) in &container.ipam_ips {
        let Some(network) = driver.get_network_by_docker_id(docker_network_id) else {
            continue;
        };
        if container.ips.get(docker_network_id) == Some(ipam_ip) {
            continue;
        }
        let (Some(info), Some(pool)) = (network.info().await, network.pool().await) else {
            continue;
        };
        if !info.host_subnet.contains(ipam_ip) {
            continue;
        }
        match pool.release_ip_if_reserved(*ipam_ip).await {
            Ok(true) => info!(container_id = %container.id, ip = %ipam_ip, "released stale IPAM address"),
            Ok(false) => {}
            Err(err) => warn!(container_id = %container.id, ip = %ipam_ip, error = %err,
                              "failed to release stale IPAM address"),
        }
    }

    if let Some(service_id) = container.service_id.clone().filter(|id| !id.is_empty()) {
        let name = container.service_name.clone().unwrap_or_default();
        let service = get_or_create_service(&driver, &service_id, &name);
        service.add_container(container);
    }
}

fn handle_container_changed(
    driver: &Arc<FlannelDriver>,
    previous: &ContainerInfo,
    current: &ContainerInfo,
) {
    debug!(container_id = %current.id, "handling container change");
    driver.resolver.update_container(current);

    // A nameserver only exists for containers joined to one of our
    // networks; for those, follow endpoint attach/detach.
    let Some(nameserver) = driver
        .nameservers_by_sandbox
        .get(&adjust_sandbox_key(&current.sandbox_key))
    else {
        return;
    };
    for (network_id, endpoint_id) in &previous.endpoints {
        if !current.endpoints.contains_key(network_id) {
            driver.nameservers_by_endpoint.try_remove(endpoint_id);
            nameserver.remove_valid_network(network_id);
        }
    }
    for (network_id, endpoint_id) in &current.endpoints {
        if !previous.endpoints.contains_key(network_id) {
            driver
                .nameservers_by_endpoint
                .insert(endpoint_id.clone(), nameserver.clone());
            nameserver.add_valid_network(network_id);
        }
    }

    if let Some(service_id) = current.service_id.clone().filter(|id| !id.is_empty()) {
        if let Some(service) = driver.services.get(&service_id) {
            service.add_container(current.clone());
        }
    }
}

async fn handle_container_removed(driver: Arc<FlannelDriver>, container: ContainerInfo) {
    debug!(container_id = %container.id, "handling container removal");
    driver.resolver.remove_container(&container.id);

    if let Some(service_id) = container.service_id.as_deref() {
        if let Some(service) = driver.services.get(&service_id.to_string()) {
            service.remove_container(&container.id);
        }
    }

    if let Some(nameserver) = driver
        .nameservers_by_sandbox
        .try_remove(&adjust_sandbox_key(&container.sandbox_key))
    {
        if let Err(err) = nameserver.deactivate().await {
            warn!(container_id = %container.id, error = %err, "nameserver shutdown failed");
        }
    }
}

/// Create the service holder with its event wiring, or fetch the existing
/// one. Container events may create the service before the service event
/// arrives with mode and networks.
pub fn get_or_create_service(
    driver: &Arc<FlannelDriver>,
    service_id: &str,
    name: &str,
) -> Arc<Service> {
    let (service, created) = driver.services.get_or_insert_with(service_id.to_string(), || {
        Service::new(service_id, name)
    });
    if !created {
        return service;
    }

    let events = service.events();
    for event in [
        &events.initialized,
        &events.networks_changed,
        &events.endpoint_mode_changed,
    ] {
        let driver = driver.clone();
        event.subscribe(move |snapshot| {
            let driver = driver.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                reconcile_service(driver, snapshot).await;
            });
        });
    }
    {
        let driver = driver.clone();
        events.container_added.subscribe(move |(snapshot, _)| {
            let driver = driver.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                reconcile_service(driver, snapshot).await;
            });
        });
    }
    {
        let driver = driver.clone();
        events.container_removed.subscribe(move |(snapshot, _)| {
            let driver = driver.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                reconcile_service(driver, snapshot).await;
            });
        });
    }
    {
        // VIP changes only move the DNS view; the balancer set them.
        let driver = driver.clone();
        events.vips_changed.subscribe(move |snapshot| {
            driver.resolver.add_service(&dns_view(snapshot));
        });
    }

    service
}

/// Bring DNS and (for vip mode) the load balancer in line with a service
/// snapshot.
async fn reconcile_service(driver: Arc<FlannelDriver>, snapshot: ServiceSnapshot) {
    driver.resolver.add_service(&dns_view(&snapshot));

    if snapshot.endpoint_mode != Some(EndpointMode::Vip) {
        return;
    }
    let lb_service = lb_view(&snapshot);
    match driver.lb.create_or_update(&lb_service).await {
        Ok(vips) if !vips.is_empty() => {
            if let Some(service) = driver.services.get(&snapshot.id) {
                service.set_vips(vips);
            }
        }
        Ok(_) => {}
        Err(err) => {
            warn!(service_id = %snapshot.id, error = %err, "load-balancer reconcile failed")
        }
    }
}

fn backends_per_network(snapshot: &ServiceSnapshot) -> HashMap<String, BTreeSet<std::net::Ipv4Addr>> {
    let mut backends: HashMap<String, BTreeSet<std::net::Ipv4Addr>> = HashMap::new();
    for network_id in &snapshot.networks {
        let entry = backends.entry(network_id.clone()).or_default();
        for container in snapshot.containers.values() {
            if let Some(ip) = container.ips.get(network_id) {
                entry.insert(*ip);
            }
        }
    }
    backends
}

fn dns_view(snapshot: &ServiceSnapshot) -> ServiceDnsView {
    let vips = match snapshot.endpoint_mode {
        Some(EndpointMode::Vip) if !snapshot.vips.is_empty() => snapshot.vips.clone(),
        // Until the balancer reserved its VIPs, the runtime's IPAM ones
        // are the best answer.
        Some(EndpointMode::Vip) => snapshot.ipam_vips.clone(),
        _ => HashMap::new(),
    };
    ServiceDnsView {
        id: snapshot.id.clone(),
        name: snapshot.name.clone(),
        vips,
        backends: backends_per_network(snapshot),
    }
}

fn lb_view(snapshot: &ServiceSnapshot) -> LbService {
    LbService {
        id: snapshot.id.clone(),
        name: snapshot.name.clone(),
        networks: snapshot.networks.clone(),
        preferred_vips: snapshot.ipam_vips.clone(),
        backends: backends_per_network(snapshot),
    }
}

/// The runtime reports sandbox paths as host paths; the driver container
/// sees the host filesystem under [`HOSTFS_PREFIX`].
fn adjust_sandbox_key(sandbox_key: &str) -> String {
    if sandbox_key.starts_with(HOSTFS_PREFIX) {
        sandbox_key.to_string()
    } else {
        format!("{HOSTFS_PREFIX}{sandbox_key}")
    }
}

/// Fetch or create and activate the nameserver for a sandbox.
pub async fn get_or_add_nameserver(
    driver: &FlannelDriver,
    sandbox_key: &str,
) -> Result<Arc<Nameserver>> {
    let key = adjust_sandbox_key(sandbox_key);
    if let Some(nameserver) = driver.nameservers_by_sandbox.get(&key) {
        return Ok(nameserver);
    }
    let nameserver = Nameserver::new(&key, driver.resolver.clone());
    nameserver.clone().activate().await?;
    driver
        .nameservers_by_sandbox
        .insert(key, nameserver.clone());
    Ok(nameserver)
}

/// On startup, containers already attached to our networks need their
/// nameservers injected; only this host's shard is considered.
pub fn inject_nameservers_into_running_containers(driver: &Arc<FlannelDriver>) {
    let Some(data) = driver.docker_data() else { return };

    let our_network_ids: Vec<String> = data
        .networks()
        .get_all()
        .into_iter()
        .filter(|(_, network)| network.is_flannel_network())
        .map(|(id, _)| id)
        .collect();

    let Some(local) = data.containers().get_shard(data.containers().local_shard_key()) else {
        return;
    };
    for container in local.into_values() {
        if !container
            .ips
            .keys()
            .any(|network_id| our_network_ids.contains(network_id))
        {
            continue;
        }
        let driver = driver.clone();
        tokio::spawn(async move {
            let nameserver = match get_or_add_nameserver(&driver, &container.sandbox_key).await {
                Ok(nameserver) => nameserver,
                Err(err) => {
                    warn!(container_id = %container.id, error = %err,
                          "nameserver injection failed");
                    return;
                }
            };
            info!(container_id = %container.id, "injected nameserver into running container");
            for (network_id, endpoint_id) in &container.endpoints {
                driver
                    .nameservers_by_endpoint
                    .insert(endpoint_id.clone(), nameserver.clone());
                nameserver.add_valid_network(network_id);
            }
        });
    }
}
