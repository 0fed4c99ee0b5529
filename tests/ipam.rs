//! Address-space and pool allocation tests.

mod common;

use flannel_np::ipam::pool::AddressPool;
use flannel_np::ipam::space::AddressSpace;
use flannel_np::ipam::ReservationType;
use ipnet::Ipv4Net;

fn supernets() -> Vec<Ipv4Net> {
    vec!["10.1.0.0/16".parse().unwrap(), "10.2.0.0/16".parse().unwrap()]
}

// ============================================================================
// Pool subnet leasing
// ============================================================================

#[tokio::test]
async fn first_network_gets_the_first_candidate_pool() {
    let client = common::memory_client("/flannel/address-space");
    let space = AddressSpace::new(client.clone(), supernets(), 20);

    let pool = space.get_new_or_existing_pool("net1").await.unwrap();
    assert_eq!(pool.to_string(), "10.1.0.0/20");

    let lease = client.get(&["10.1.0.0-20"]).await.unwrap().unwrap();
    assert_eq!(lease.value, b"net1");
}

#[tokio::test]
async fn repeated_requests_return_the_same_pool() {
    let client = common::memory_client("/flannel/address-space");
    let space = AddressSpace::new(client, supernets(), 20);

    let first = space.get_new_or_existing_pool("net1").await.unwrap();
    let second = space.get_new_or_existing_pool("net1").await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn distinct_networks_never_share_a_subnet() {
    let client = common::memory_client("/flannel/address-space");
    let space = AddressSpace::new(client, supernets(), 20);

    let a = space.get_new_or_existing_pool("net1").await.unwrap();
    let b = space.get_new_or_existing_pool("net2").await.unwrap();
    assert_ne!(a, b);
    assert_eq!(b.to_string(), "10.1.16.0/20");
}

#[tokio::test]
async fn concurrent_allocators_agree_via_the_kv() {
    let (client_a, client_b) = common::shared_memory_clients("/flannel/address-space");
    let space_a = AddressSpace::new(client_a, supernets(), 20);
    let space_b = AddressSpace::new(client_b, supernets(), 20);

    // Same network from two hosts -> same pool.
    let a = space_a.get_new_or_existing_pool("net1").await.unwrap();
    let b = space_b.get_new_or_existing_pool("net1").await.unwrap();
    assert_eq!(a, b);

    // A different network from the other host gets the next subnet.
    let c = space_b.get_new_or_existing_pool("net2").await.unwrap();
    assert_ne!(a, c);
}

#[tokio::test]
async fn exhausted_address_space_is_an_error() {
    let client = common::memory_client("/flannel/address-space");
    // A single /16 carved into /17 pools has exactly two candidates.
    let space = AddressSpace::new(client, vec!["10.1.0.0/16".parse().unwrap()], 17);

    space.get_new_or_existing_pool("net1").await.unwrap();
    space.get_new_or_existing_pool("net2").await.unwrap();
    let err = space.get_new_or_existing_pool("net3").await.unwrap_err();
    assert!(err.to_string().contains("no free pool subnet"));
}

#[tokio::test]
async fn released_pools_are_reusable_and_release_is_idempotent() {
    let client = common::memory_client("/flannel/address-space");
    let space = AddressSpace::new(client, vec!["10.1.0.0/16".parse().unwrap()], 17);

    space.get_new_or_existing_pool("net1").await.unwrap();
    space.get_new_or_existing_pool("net2").await.unwrap();

    space.release_pool("net1").await.unwrap();
    space.release_pool("net1").await.unwrap(); // already gone

    let reused = space.get_new_or_existing_pool("net3").await.unwrap();
    assert_eq!(reused.to_string(), "10.1.0.0/17");
}

// ============================================================================
// Per-network pools across hosts
// ============================================================================

#[tokio::test]
async fn two_hosts_never_hand_out_the_same_address() {
    let (client_a, client_b) = common::shared_memory_clients("/flannel/networks/net1");
    let sub = ["host-subnets", "10.1.0.0-28"];

    // Both hosts work the same host subnet (one /28, gateway + 13 free).
    let pool_a = AddressPool::new(
        "net1",
        "10.1.0.0/28".parse().unwrap(),
        "10.1.0.1".parse().unwrap(),
        client_a.sub(&sub),
    )
    .await
    .unwrap();
    let pool_b = AddressPool::new(
        "net1",
        "10.1.0.0/28".parse().unwrap(),
        "10.1.0.1".parse().unwrap(),
        client_b.sub(&sub),
    )
    .await
    .unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..6 {
        let a = pool_a
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        assert!(seen.insert(a), "address {a} handed out twice");
        let b = pool_b
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        assert!(seen.insert(b), "address {b} handed out twice");
    }
}

#[tokio::test]
async fn scenario_allocation_with_mac_writes_type_and_mac_keys() {
    let client = common::memory_client("/flannel/networks/net1");
    let pool_client = client.sub(&["host-subnets", "10.1.0.0-25"]);
    let pool = AddressPool::new(
        "net1",
        "10.1.0.0/25".parse().unwrap(),
        "10.1.0.1".parse().unwrap(),
        pool_client.clone(),
    )
    .await
    .unwrap();

    // First-pass IPAM reserved the address without a MAC.
    pool.allocate_ip(None, None, ReservationType::Reserved, false)
        .await
        .unwrap();

    let ip = pool
        .allocate_ip(
            Some("10.1.0.2".parse().unwrap()),
            Some("02:42:0a:01:00:05"),
            ReservationType::ContainerIp,
            false,
        )
        .await
        .unwrap();
    assert_eq!(ip.to_string(), "10.1.0.2");

    let record = pool_client.get(&["10.1.0.2"]).await.unwrap().unwrap();
    assert_eq!(record.value, b"container-ip");
    let mac = pool_client.get(&["10.1.0.2", "mac"]).await.unwrap().unwrap();
    assert_eq!(mac.value, b"02:42:0a:01:00:05");
}

#[tokio::test]
async fn remote_release_makes_the_address_reusable_here() {
    let (client_a, client_b) = common::shared_memory_clients("/flannel/networks/net1");
    let sub = ["host-subnets", "10.1.0.0-30"];

    let pool_a = AddressPool::new(
        "net1",
        "10.1.0.0/30".parse().unwrap(),
        "10.1.0.1".parse().unwrap(),
        client_a.sub(&sub),
    )
    .await
    .unwrap();
    let pool_b = AddressPool::new(
        "net1",
        "10.1.0.0/30".parse().unwrap(),
        "10.1.0.1".parse().unwrap(),
        client_b.sub(&sub),
    )
    .await
    .unwrap();

    // Host A takes the only free address, the other host sees it as taken.
    let ip = pool_a
        .allocate_ip(None, None, ReservationType::Reserved, false)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(pool_b
        .allocate_ip(None, None, ReservationType::Reserved, false)
        .await
        .is_err());

    // After A releases it, B can take it.
    pool_a.release_ip(ip).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let reused = pool_b
        .allocate_ip(None, None, ReservationType::Reserved, false)
        .await
        .unwrap();
    assert_eq!(reused, ip);
}
