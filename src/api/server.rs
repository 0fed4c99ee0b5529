//! Unix-socket plugin server.

use crate::api::{ipam, network};
use crate::core::error::{DriverError, Result};
use crate::driver::FlannelDriver;
use axum::routing::post;
use axum::{Json, Router};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::info;

async fn activate() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Implements": ["IpamDriver", "NetworkDriver"] }))
}

/// The full plugin route table.
pub fn router(driver: Arc<FlannelDriver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        // IPAM driver
        .route("/IpamDriver.GetCapabilities", post(ipam::get_capabilities))
        .route(
            "/IpamDriver.GetDefaultAddressSpaces",
            post(ipam::get_default_address_spaces),
        )
        .route("/IpamDriver.RequestPool", post(ipam::request_pool))
        .route("/IpamDriver.ReleasePool", post(ipam::release_pool))
        .route("/IpamDriver.RequestAddress", post(ipam::request_address))
        .route("/IpamDriver.ReleaseAddress", post(ipam::release_address))
        // Network driver
        .route(
            "/NetworkDriver.GetCapabilities",
            post(network::get_capabilities),
        )
        .route("/NetworkDriver.CreateNetwork", post(network::noop))
        .route("/NetworkDriver.DeleteNetwork", post(network::noop))
        .route("/NetworkDriver.AllocateNetwork", post(network::noop))
        .route("/NetworkDriver.FreeNetwork", post(network::noop))
        .route("/NetworkDriver.CreateEndpoint", post(network::create_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(network::endpoint_info))
        .route("/NetworkDriver.Join", post(network::join))
        .route("/NetworkDriver.Leave", post(network::leave))
        .route("/NetworkDriver.DeleteEndpoint", post(network::delete_endpoint))
        .route("/NetworkDriver.DiscoverNew", post(network::noop))
        .route("/NetworkDriver.DiscoverDelete", post(network::noop))
        .route(
            "/NetworkDriver.ProgramExternalConnectivity",
            post(network::noop),
        )
        .route(
            "/NetworkDriver.RevokeExternalConnectivity",
            post(network::noop),
        )
        .with_state(driver)
}

/// Bind the plugin socket and serve until the process exits.
pub async fn serve(driver: Arc<FlannelDriver>, socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A previous run may have left the socket file behind.
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(socket = %socket_path.display(), "plugin socket listening");

    axum::serve(listener, router(driver))
        .await
        .map_err(|err| DriverError::external("plugin-server", err.to_string()))
}
