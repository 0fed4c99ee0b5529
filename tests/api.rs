//! Plugin RPC dispatch tests.
//!
//! Drives the router directly with tower, backed by the in-memory KV and
//! the runtime stub; no socket, etcd or Docker daemon involved.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use flannel_np::api::server::router;
use flannel_np::core::config::Config;
use flannel_np::driver::FlannelDriver;
use flannel_np::kv::memory::MemoryKv;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

async fn test_driver() -> Arc<FlannelDriver> {
    let vars = HashMap::from([
        ("ETCD_ENDPOINTS".to_string(), "memory://local".to_string()),
        ("ETCD_PREFIX".to_string(), "/flannel".to_string()),
        ("AVAILABLE_SUBNETS".to_string(), "10.1.0.0/16".to_string()),
        ("NETWORK_SUBNET_SIZE".to_string(), "20".to_string()),
        ("DEFAULT_HOST_SUBNET_SIZE".to_string(), "25".to_string()),
    ]);
    let config = Config::from_vars(&vars).unwrap();
    FlannelDriver::init(config, MemoryKv::shared(), common::MockRuntime::manager())
        .await
        .unwrap()
}

async fn call(driver: &Arc<FlannelDriver>, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router(driver.clone()).oneshot(request).await.unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test(flavor = "multi_thread")]
async fn activate_declares_both_driver_interfaces() {
    let driver = test_driver().await;
    let (status, body) = call(&driver, "/Plugin.Activate", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Implements"], json!(["IpamDriver", "NetworkDriver"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn ipam_capabilities_require_mac_addresses() {
    let driver = test_driver().await;
    let (status, body) = call(&driver, "/IpamDriver.GetCapabilities", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["RequiresMACAddress"], json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn default_address_spaces_are_flannel_scoped() {
    let driver = test_driver().await;
    let (_, body) = call(&driver, "/IpamDriver.GetDefaultAddressSpaces", json!({})).await;
    assert_eq!(body["LocalDefaultAddressSpace"], "FlannelLocal");
    assert_eq!(body["GlobalDefaultAddressSpace"], "FlannelGlobal");
}

#[tokio::test(flavor = "multi_thread")]
async fn network_capabilities_are_global_scope() {
    let driver = test_driver().await;
    let (_, body) = call(&driver, "/NetworkDriver.GetCapabilities", json!({})).await;
    assert_eq!(body["Scope"], "global");
    assert_eq!(body["ConnectivityScope"], "global");
}

#[tokio::test(flavor = "multi_thread")]
async fn request_pool_requires_a_flannel_id() {
    let driver = test_driver().await;
    let (status, body) = call(
        &driver,
        "/IpamDriver.RequestPool",
        json!({"Options": {}, "V6": false}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["Err"].as_str().unwrap().contains("flannel-id"));
}

#[tokio::test(flavor = "multi_thread")]
async fn request_pool_rejects_ipv6() {
    let driver = test_driver().await;
    let (status, body) = call(
        &driver,
        "/IpamDriver.RequestPool",
        json!({"Options": {"flannel-id": "net1"}, "V6": true}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["Err"].as_str().unwrap().contains("IPv6"));
}

#[tokio::test(flavor = "multi_thread")]
async fn release_pool_is_a_no_op() {
    let driver = test_driver().await;
    let (status, _) = call(
        &driver,
        "/IpamDriver.ReleasePool",
        json!({"PoolID": "FlannelPool-net1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_endpoint_of_unknown_endpoint_succeeds() {
    let driver = test_driver().await;
    let (status, _) = call(
        &driver,
        "/NetworkDriver.DeleteEndpoint",
        json!({"NetworkID": "unknown", "EndpointID": "ep-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_endpoint_requires_address_and_mac() {
    let driver = test_driver().await;
    let (status, body) = call(
        &driver,
        "/NetworkDriver.CreateEndpoint",
        json!({
            "NetworkID": "d1",
            "EndpointID": "ep-1",
            "Interface": {"Address": "", "MacAddress": ""}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["Err"].as_str().unwrap().contains("MAC"));
}

#[tokio::test(flavor = "multi_thread")]
async fn join_of_unknown_network_is_forbidden() {
    let driver = test_driver().await;
    let (status, body) = call(
        &driver,
        "/NetworkDriver.Join",
        json!({"NetworkID": "unknown", "EndpointID": "ep-1", "SandboxKey": ""}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["Err"].as_str().unwrap().contains("not found"));
}
