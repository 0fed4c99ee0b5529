//! IPAM driver endpoints.

use crate::api::{ApiError, ApiResult};
use crate::core::error::DriverError;
use crate::driver::FlannelDriver;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

const POOL_ID_PREFIX: &str = "FlannelPool";

/// `FlannelPool-<flannel-id>` -> `<flannel-id>`.
pub(crate) fn pool_id_to_flannel_id(pool_id: &str) -> Option<&str> {
    pool_id
        .split_once('-')
        .filter(|(prefix, rest)| *prefix == POOL_ID_PREFIX && !rest.is_empty())
        .map(|(_, rest)| rest)
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "RequiresMACAddress")]
    pub requires_mac_address: bool,
}

pub async fn get_capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        requires_mac_address: true,
    })
}

#[derive(Debug, Serialize)]
pub struct AddressSpacesResponse {
    #[serde(rename = "LocalDefaultAddressSpace")]
    pub local: String,
    #[serde(rename = "GlobalDefaultAddressSpace")]
    pub global: String,
}

pub async fn get_default_address_spaces() -> Json<AddressSpacesResponse> {
    Json(AddressSpacesResponse {
        local: "FlannelLocal".to_string(),
        global: "FlannelGlobal".to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestPoolRequest {
    #[serde(rename = "Pool", default)]
    pub pool: String,
    #[serde(rename = "SubPool", default)]
    pub sub_pool: String,
    #[serde(rename = "Options", default)]
    pub options: HashMap<String, String>,
    #[serde(rename = "V6", default)]
    pub v6: bool,
}

#[derive(Debug, Serialize)]
pub struct RequestPoolResponse {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    #[serde(rename = "Pool")]
    pub pool: String,
}

pub async fn request_pool(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<RequestPoolRequest>,
) -> ApiResult<RequestPoolResponse> {
    let _guard = driver.rpc_guard().await;
    debug!(?request.options, v6 = request.v6, "RequestPool");

    if request.v6 {
        return Err(DriverError::InvalidInput("IPv6 pools are not supported".into()).into());
    }
    let flannel_id = request
        .options
        .get("flannel-id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ApiError(DriverError::InvalidInput(
                "the IPAM option 'flannel-id' must be set to a unique ID".into(),
            ))
        })?;

    let info = driver.request_pool(flannel_id).await?;
    Ok(Json(RequestPoolResponse {
        pool_id: format!("{POOL_ID_PREFIX}-{flannel_id}"),
        pool: info.network.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleasePoolRequest {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
}

/// The pool lease is released when the runtime reports the network
/// removed, not here.
pub async fn release_pool(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<ReleasePoolRequest>,
) -> ApiResult<serde_json::Value> {
    let _guard = driver.rpc_guard().await;
    debug!(pool_id = %request.pool_id, "ReleasePool (no-op)");
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
pub struct RequestAddressRequest {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Options", default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct RequestAddressResponse {
    #[serde(rename = "Address")]
    pub address: String,
}

pub async fn request_address(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<RequestAddressRequest>,
) -> ApiResult<RequestAddressResponse> {
    let _guard = driver.rpc_guard().await;
    debug!(pool_id = %request.pool_id, address = %request.address, "RequestAddress");

    let flannel_id = pool_id_to_flannel_id(&request.pool_id)
        .ok_or_else(|| ApiError(DriverError::not_found("network", request.pool_id.clone())))?;

    if request.options.get("RequestAddressType").map(String::as_str)
        == Some("com.docker.network.gateway")
    {
        let gateway = driver.gateway_address(flannel_id).await?;
        return Ok(Json(RequestAddressResponse {
            address: format!("{gateway}/32"),
        }));
    }

    let preferred = match request.address.as_str() {
        "" => None,
        raw => Some(raw.parse::<Ipv4Addr>().map_err(|_| {
            ApiError(DriverError::InvalidInput(format!(
                "requested address {raw:?} is not an IPv4 address"
            )))
        })?),
    };
    let mac = request
        .options
        .get("com.docker.network.endpoint.macaddress")
        .filter(|mac| !mac.is_empty())
        .map(String::as_str);

    let (ip, prefix_len) = driver.request_address(flannel_id, preferred, mac).await?;
    Ok(Json(RequestAddressResponse {
        address: format!("{ip}/{prefix_len}"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseAddressRequest {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    #[serde(rename = "Address")]
    pub address: String,
}

pub async fn release_address(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<ReleaseAddressRequest>,
) -> ApiResult<serde_json::Value> {
    let _guard = driver.rpc_guard().await;
    debug!(pool_id = %request.pool_id, address = %request.address, "ReleaseAddress");

    let flannel_id = pool_id_to_flannel_id(&request.pool_id)
        .ok_or_else(|| ApiError(DriverError::not_found("network", request.pool_id.clone())))?;
    let address: Ipv4Addr = request.address.parse().map_err(|_| {
        ApiError(DriverError::InvalidInput(format!(
            "address {:?} is not an IPv4 address",
            request.address
        )))
    })?;

    driver.release_address(flannel_id, address).await?;
    Ok(Json(serde_json::json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_round_trip() {
        assert_eq!(pool_id_to_flannel_id("FlannelPool-net1"), Some("net1"));
        assert_eq!(
            pool_id_to_flannel_id("FlannelPool-my-net-1"),
            Some("my-net-1")
        );
        assert_eq!(pool_id_to_flannel_id("FlannelPool-"), None);
        assert_eq!(pool_id_to_flannel_id("OtherPool-net1"), None);
    }
}
