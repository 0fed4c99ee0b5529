//! DNS resolver visibility tests.

mod common;

use flannel_np::dns::{Resolver, ServiceDnsView};
use flannel_np::docker::types::ContainerInfo;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

fn container(id: &str, name: &str, attachments: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: id.into(),
        name: name.into(),
        ips: attachments
            .iter()
            .map(|(network, ip)| (network.to_string(), ip.parse().unwrap()))
            .collect(),
        ..Default::default()
    }
}

#[test]
fn peer_container_resolves_only_on_shared_networks() {
    let resolver = Resolver::new(false);
    resolver.add_container(&container("c2", "c2", &[("n1", "10.1.0.5")]));

    // A sandbox on n1 sees the peer.
    assert_eq!(
        resolver.resolve_name("c2", &["n1".to_string()]),
        vec!["10.1.0.5".parse::<Ipv4Addr>().unwrap()]
    );
    // A sandbox attached only to n2 does not; the query gets forwarded.
    assert!(resolver.resolve_name("c2", &["n2".to_string()]).is_empty());
}

#[test]
fn container_on_two_networks_answers_with_the_visible_addresses() {
    let resolver = Resolver::new(false);
    resolver.add_container(&container(
        "c1",
        "db",
        &[("n1", "10.1.0.5"), ("n2", "10.2.0.5")],
    ));

    assert_eq!(
        resolver.resolve_name("db", &["n1".to_string()]),
        vec!["10.1.0.5".parse::<Ipv4Addr>().unwrap()]
    );
    let both = resolver.resolve_name("db", &["n1".to_string(), "n2".to_string()]);
    assert_eq!(both.len(), 2);
}

#[test]
fn aliases_resolve_alongside_the_container_name() {
    let resolver = Resolver::new(false);
    let mut info = container("c1", "stack_web_1", &[("n1", "10.1.0.9")]);
    info.dns_names
        .insert("n1".to_string(), vec!["web".to_string(), "frontend".to_string()]);
    resolver.add_container(&info);

    for name in ["stack_web_1", "web", "frontend"] {
        assert_eq!(
            resolver.resolve_name(name, &["n1".to_string()]),
            vec!["10.1.0.9".parse::<Ipv4Addr>().unwrap()],
            "name {name} should resolve"
        );
    }
}

#[test]
fn reverse_lookup_respects_network_visibility() {
    let resolver = Resolver::new(false);
    resolver.add_container(&container("c1", "db", &[("n1", "10.1.0.7")]));

    assert_eq!(
        resolver.resolve_ip("10.1.0.7".parse().unwrap(), &["n1".to_string()]),
        vec!["db".to_string()]
    );
    assert!(resolver
        .resolve_ip("10.1.0.7".parse().unwrap(), &["n2".to_string()])
        .is_empty());
}

#[test]
fn service_resolution_tracks_replica_churn() {
    let resolver = Resolver::new(false);
    let mut backends: BTreeSet<Ipv4Addr> =
        ["10.1.0.5".parse().unwrap(), "10.1.0.6".parse().unwrap()].into();
    let mut view = ServiceDnsView {
        id: "s1".into(),
        name: "workers".into(),
        vips: HashMap::new(),
        backends: HashMap::from([("n1".to_string(), backends.clone())]),
    };
    resolver.add_service(&view);
    assert_eq!(resolver.resolve_name("workers", &["n1".to_string()]).len(), 2);

    // One replica dies; re-indexing replaces the answer set.
    backends.remove(&"10.1.0.6".parse().unwrap());
    view.backends.insert("n1".to_string(), backends);
    resolver.add_service(&view);
    assert_eq!(
        resolver.resolve_name("workers", &["n1".to_string()]),
        vec!["10.1.0.5".parse::<Ipv4Addr>().unwrap()]
    );
}
