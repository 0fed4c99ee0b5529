//! Runtime event loop.
//!
//! Follows the runtime's event stream and drives the fan-in handlers. The
//! stream breaks whenever the runtime restarts; the loop resubscribes after
//! a fixed backoff and re-syncs the container shard to cover the gap.

use crate::docker::api::RuntimeEvent;
use crate::docker::data::DockerData;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Run forever; spawned as a background task at startup.
pub async fn run_event_loop(data: Arc<DockerData>) {
    loop {
        let mut stream = match data.runtime().subscribe_events().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "cannot subscribe to runtime events, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        debug!("runtime event stream open");

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => handle_event(&data, event).await,
                Err(err) => {
                    warn!(error = %err, "runtime event stream failed, resubscribing");
                    break;
                }
            }
        }

        tokio::time::sleep(RECONNECT_BACKOFF).await;
        if let Err(err) = data.sync_containers().await {
            warn!(error = %err, "container re-sync after stream gap failed");
        }
    }
}

async fn handle_event(data: &DockerData, event: RuntimeEvent) {
    debug!(?event, "runtime event");
    let result = match &event {
        RuntimeEvent::NetworkUpdated { network_id } => data.handle_network(network_id).await,
        RuntimeEvent::NetworkRemoved { network_id } => {
            data.handle_deleted_network(network_id).await
        }
        RuntimeEvent::NetworkConnected { container_id }
        | RuntimeEvent::NetworkDisconnected { container_id } => {
            data.handle_container(container_id).await
        }
        RuntimeEvent::ServiceUpdated { service_id } => data.handle_service(service_id).await,
        RuntimeEvent::ServiceRemoved { service_id } => {
            data.handle_deleted_service(service_id).await
        }
        RuntimeEvent::ContainerGone { container_id } => {
            data.handle_deleted_container(container_id).await
        }
    };
    if let Err(err) = result {
        warn!(?event, error = %err, "runtime event handling failed");
    }
}
