//! Network driver endpoints.

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

/// Static-route type: gateway hop.
const ROUTE_TYPE_NEXTHOP: u8 = 0;
/// Static-route type: directly connected.
const ROUTE_TYPE_CONNECTED: u8 = 1;

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Scope")]
    pub scope: String,
    #[serde(rename = "ConnectivityScope")]
    pub connectivity_scope: String,
}

pub async fn get_capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        scope: "global".to_string(),
        connectivity_scope: "global".to_string(),
    })
}

/// Accepted and ignored: the overlay lifecycle is driven by the IPAM pool
/// requests and the runtime's network events.
pub async fn noop() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

#[derive(Debug, Deserialize)]
pub struct EndpointInterface {
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "AddressIPv6", default)]
    pub address_ipv6: String,
    #[serde(rename = "MacAddress", default)]
    pub mac_address: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "Interface")]
    pub interface: Option<EndpointInterface>,
}

#[derive(Debug, Serialize)]
pub struct CreateEndpointResponse {
    // Returning the interface back unchanged trips the runtime's
    // "cannot change" validation, so it is always omitted.
    #[serde(rename = "Interface", skip_serializing_if = "Option::is_none")]
    pub interface: Option<serde_json::Value>,
}

pub async fn create_endpoint(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<CreateEndpointRequest>,
) -> ApiResult<CreateEndpointResponse> {
    let _guard = driver.rpc_guard().await;
    debug!(network_id = %request.network_id, endpoint_id = %request.endpoint_id, "CreateEndpoint");

    let interface = request.interface.as_ref().filter(|interface| {
        !interface.address.is_empty() && !interface.mac_address.is_empty()
    });
    let Some(interface) = interface else {
        return Err(DriverError::InvalidInput(format!(
            "endpoint {} for network {} needs interface info with an IPv4 address and a MAC address",
            request.endpoint_id, request.network_id
        ))
        .into());
    };

    let address = parse_cidr_address(&interface.address)?;
    driver
        .create_endpoint(
            &request.network_id,
            &request.endpoint_id,
            address,
            &interface.mac_address,
        )
        .await?;

    Ok(Json(CreateEndpointResponse { interface: None }))
}

#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointInfoResponse {
    #[serde(rename = "Value")]
    pub value: HashMap<String, String>,
}

pub async fn endpoint_info(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<EndpointRequest>,
) -> ApiResult<EndpointInfoResponse> {
    let _guard = driver.rpc_guard().await;
    let (ip, mac) = driver
        .endpoint_info(&request.network_id, &request.endpoint_id)
        .await?;
    Ok(Json(EndpointInfoResponse {
        value: HashMap::from([
            ("ip_address".to_string(), ip.to_string()),
            ("mac_address".to_string(), mac),
        ]),
    }))
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "SandboxKey", default)]
    pub sandbox_key: String,
    #[serde(rename = "Options", default)]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct InterfaceName {
    #[serde(rename = "SrcName")]
    pub src_name: String,
    #[serde(rename = "DstPrefix")]
    pub dst_prefix: String,
}

#[derive(Debug, Serialize)]
pub struct StaticRoute {
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "RouteType")]
    pub route_type: u8,
    #[serde(rename = "NextHop", skip_serializing_if = "String::is_empty")]
    pub next_hop: String,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    #[serde(rename = "InterfaceName")]
    pub interface_name: InterfaceName,
    #[serde(rename = "StaticRoutes")]
    pub static_routes: Vec<StaticRoute>,
    #[serde(rename = "DisableGatewayService")]
    pub disable_gateway_service: bool,
}

pub async fn join(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<JoinRequest>,
) -> ApiResult<JoinResponse> {
    let _guard = driver.rpc_guard().await;
    debug!(network_id = %request.network_id, endpoint_id = %request.endpoint_id,
           sandbox_key = %request.sandbox_key, "Join");

    let (pair, info) = driver
        .join_endpoint(&request.network_id, &request.endpoint_id, &request.sandbox_key)
        .await?;

    Ok(Json(JoinResponse {
        interface_name: InterfaceName {
            src_name: pair.inside,
            dst_prefix: "eth".to_string(),
        },
        static_routes: vec![
            StaticRoute {
                destination: info.host_subnet.to_string(),
                route_type: ROUTE_TYPE_CONNECTED,
                next_hop: String::new(),
            },
            StaticRoute {
                destination: info.network.to_string(),
                route_type: ROUTE_TYPE_NEXTHOP,
                next_hop: info.local_gateway.to_string(),
            },
        ],
        disable_gateway_service: false,
    }))
}

pub async fn leave(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<EndpointRequest>,
) -> ApiResult<serde_json::Value> {
    let _guard = driver.rpc_guard().await;
    debug!(network_id = %request.network_id, endpoint_id = %request.endpoint_id, "Leave");
    match driver
        .leave_endpoint(&request.network_id, &request.endpoint_id)
        .await
    {
        Ok(()) => Ok(Json(serde_json::json!({}))),
        Err(err) if err.ignorable_on_delete() => Ok(Json(serde_json::json!({}))),
        Err(err) => Err(err.into()),
    }
}

pub async fn delete_endpoint(
    State(driver): State<Arc<FlannelDriver>>,
    Json(request): Json<EndpointRequest>,
) -> ApiResult<serde_json::Value> {
    let _guard = driver.rpc_guard().await;
    debug!(network_id = %request.network_id, endpoint_id = %request.endpoint_id, "DeleteEndpoint");
    match driver
        .delete_endpoint(&request.network_id, &request.endpoint_id)
        .await
    {
        Ok(()) => Ok(Json(serde_json::json!({}))),
        Err(err) if err.ignorable_on_delete() => Ok(Json(serde_json::json!({}))),
        Err(err) => Err(err.into()),
    }
}

/// `10.1.0.5/25` or bare `10.1.0.5` -> address part.
fn parse_cidr_address(raw: &str) -> Result<Ipv4Addr, ApiError> {
    let ip_part = raw.split('/').next().unwrap_or_default();
    ip_part.parse().map_err(|_| {
        ApiError(DriverError::InvalidInput(format!(
            "interface address {raw:?} is not an IPv4 address"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_and_bare_addresses_both_parse() {
        assert_eq!(
            parse_cidr_address("10.1.0.5/25").unwrap(),
            "10.1.0.5".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            parse_cidr_address("10.1.0.5").unwrap(),
            "10.1.0.5".parse::<Ipv4Addr>().unwrap()
        );
        assert!(parse_cidr_address("fe80::1/64").is_err());
    }

    #[test]
    fn join_response_serializes_the_route_table_shape() {
        let response = JoinResponse {
            interface_name: InterfaceName {
                src_name: "veth0a1b2c3d".into(),
                dst_prefix: "eth".into(),
            },
            static_routes: vec![
                StaticRoute {
                    destination: "10.1.0.0/25".into(),
                    route_type: ROUTE_TYPE_CONNECTED,
                    next_hop: String::new(),
                },
                StaticRoute {
                    destination: "10.1.0.0/20".into(),
                    route_type: ROUTE_TYPE_NEXTHOP,
                    next_hop: "10.1.0.1".into(),
                },
            ],
            disable_gateway_service: false,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["InterfaceName"]["DstPrefix"], "eth");
        assert_eq!(value["StaticRoutes"][0]["RouteType"], 1);
        assert!(value["StaticRoutes"][0].get("NextHop").is_none());
        assert_eq!(value["StaticRoutes"][1]["NextHop"], "10.1.0.1");
    }
}
