//! Per-network IP pool.
//!
//! Hands out addresses from this host's subnet of one overlay network. The
//! KV is the cluster-wide authority (`.../<ip> -> reservation type`,
//! `.../<ip>/mac -> MAC`); the in-memory maps are a mirror plus the
//! recently-unused bookkeeping that softens address reuse: a released
//! address is kept back for five minutes unless nothing else is free.

use crate::core::error::{DriverError, Result};
use crate::ipam::subnet::usable_ips;
use crate::ipam::ReservationType;
use crate::kv::{Compare, KvClient, TxnOp, TxnRequest, WatchEvent};
use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a released address is held back from reassignment.
const REUSE_HOLD: Duration = Duration::from_secs(5 * 60);

/// Mirror of one KV reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub kind: ReservationType,
    pub mac: Option<String>,
}

#[derive(Default)]
struct PoolState {
    reserved: HashMap<Ipv4Addr, Reservation>,
    unused: HashMap<Ipv4Addr, Instant>,
}

pub struct AddressPool {
    pool_id: String,
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    client: KvClient,
    all_ips: Vec<Ipv4Addr>,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create the pool, mark the gateway reserved, load the KV mirror and
    /// start following reservation changes from other hosts.
    pub async fn new(
        pool_id: impl Into<String>,
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
        client: KvClient,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            pool_id: pool_id.into(),
            subnet,
            gateway,
            all_ips: usable_ips(&subnet),
            client,
            state: Mutex::new(PoolState::default()),
        });

        pool.ensure_gateway_reserved().await?;
        {
            let mut state = pool.state.lock().await;
            pool.resync_locked(&mut state).await?;
        }
        Arc::clone(&pool).spawn_watcher().await?;
        Ok(pool)
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Allocate one address.
    ///
    /// With a preferred address and a qualifying reservation type the KV
    /// entry left behind by an earlier pass (IPAM before container start) is
    /// re-reserved in place. Otherwise a candidate is taken from the unused
    /// set, preferring addresses that have been free for longer than the
    /// reuse hold, and claimed with a create-guard so concurrent allocators
    /// on other hosts can never double-assign.
    pub async fn allocate_ip(
        &self,
        preferred: Option<Ipv4Addr>,
        mac: Option<&str>,
        kind: ReservationType,
        random: bool,
    ) -> Result<Ipv4Addr> {
        let mut state = self.state.lock().await;

        if let Some(ip) = preferred {
            let qualifies = match kind {
                ReservationType::ContainerIp => mac.is_some(),
                ReservationType::ServiceVip => true,
                ReservationType::Reserved => false,
            };
            if qualifies && self.subnet.contains(&ip) && self.try_rereserve(ip, mac, kind).await? {
                state.unused.remove(&ip);
                state.reserved.insert(
                    ip,
                    Reservation {
                        kind,
                        mac: mac.map(str::to_string),
                    },
                );
                return Ok(ip);
            }
        }

        loop {
            let candidates = self.available_unused(&mut state).await?;
            let ip = if random {
                *candidates
                    .choose(&mut rand::thread_rng())
                    .expect("candidates are never empty here")
            } else {
                *candidates
                    .iter()
                    .min()
                    .expect("candidates are never empty here")
            };

            if self.try_reserve_fresh(ip, mac, kind).await? {
                state.unused.remove(&ip);
                state.reserved.insert(
                    ip,
                    Reservation {
                        kind,
                        mac: mac.map(str::to_string),
                    },
                );
                return Ok(ip);
            }
            // Raced by another allocator; take the address out of our view
            // and try the next candidate.
            debug!(pool = %self.pool_id, ip = %ip, "lost reservation race, retrying");
            state.unused.remove(&ip);
        }
    }

    /// Release a reservation. The KV delete is guarded by the reservation
    /// type we believe the address has; an entry that is already gone counts
    /// as released.
    pub async fn release_ip(&self, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(reservation) = state.reserved.get(&ip).cloned() else {
            return Err(DriverError::not_found("reservation", ip.to_string()));
        };

        let ip_key = self.ip_key(ip);
        let mac_key = self.mac_key(ip);
        let outcome = self
            .client
            .txn(
                TxnRequest::new()
                    .when(Compare::ValueEq(
                        ip_key.clone(),
                        reservation.kind.as_str().as_bytes().to_vec(),
                    ))
                    .then(TxnOp::Delete(ip_key.clone()))
                    .then(TxnOp::Delete(mac_key)),
            )
            .await?;

        if !outcome.succeeded && self.client.backend().get(&ip_key).await?.is_some() {
            return Err(DriverError::Conflict(format!(
                "reservation for {ip} in pool {} changed concurrently",
                self.pool_id
            )));
        }

        state.reserved.remove(&ip);
        state.unused.insert(ip, Instant::now());
        Ok(())
    }

    /// Release the address if this host believes it is reserved; unknown
    /// addresses are a no-op. Returns whether a release happened.
    pub async fn release_ip_if_reserved(&self, ip: Ipv4Addr) -> Result<bool> {
        {
            let state = self.state.lock().await;
            if !state.reserved.contains_key(&ip) {
                return Ok(false);
            }
        }
        self.release_ip(ip).await?;
        Ok(true)
    }

    /// Drop every reservation of this pool (network teardown), then rebuild
    /// the mirror. The gateway reservation is reinstated.
    pub async fn release_all_ips(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.client.delete_all().await?;
        self.ensure_gateway_reserved().await?;
        self.resync_locked(&mut state).await
    }

    /// Snapshot of the reservation mirror.
    pub async fn reservations(&self) -> HashMap<Ipv4Addr, Reservation> {
        self.state.lock().await.reserved.clone()
    }

    async fn ensure_gateway_reserved(&self) -> Result<()> {
        self.client
            .put_if_absent(
                &[&self.gateway.to_string()],
                ReservationType::Reserved.as_str(),
            )
            .await?;
        Ok(())
    }

    /// Candidate addresses for a fresh allocation, per the reuse policy:
    /// aged-out unused first, any unused second, a KV re-sync third, and
    /// exhaustion only after that.
    async fn available_unused(&self, state: &mut PoolState) -> Result<Vec<Ipv4Addr>> {
        let now = Instant::now();
        let aged: Vec<Ipv4Addr> = state
            .unused
            .iter()
            .filter(|(_, freed_at)| now.duration_since(**freed_at) >= REUSE_HOLD)
            .map(|(ip, _)| *ip)
            .collect();
        if !aged.is_empty() {
            return Ok(aged);
        }
        if !state.unused.is_empty() {
            return Ok(state.unused.keys().copied().collect());
        }

        self.resync_locked(state).await?;
        if !state.unused.is_empty() {
            return Ok(state.unused.keys().copied().collect());
        }
        Err(DriverError::Exhausted(format!(
            "no free addresses in pool {}",
            self.pool_id
        )))
    }

    /// Reload the mirror from the KV. Every address without a reservation
    /// becomes unused as of now.
    async fn resync_locked(&self, state: &mut PoolState) -> Result<()> {
        let mut reserved = HashMap::new();
        let mut macs: HashMap<Ipv4Addr, String> = HashMap::new();

        for record in self.client.get_all().await? {
            let Some(parts) = self.client.relative(&record.key) else {
                continue;
            };
            match parts.as_slice() {
                [raw_ip] => {
                    let Ok(ip) = raw_ip.parse::<Ipv4Addr>() else {
                        warn!(pool = %self.pool_id, key = %record.key, "unparsable reservation key");
                        continue;
                    };
                    let Some(kind) = ReservationType::parse(&record.value_str()) else {
                        warn!(pool = %self.pool_id, key = %record.key, "unknown reservation type");
                        continue;
                    };
                    reserved.insert(ip, Reservation { kind, mac: None });
                }
                [raw_ip, "mac"] => {
                    if let Ok(ip) = raw_ip.parse::<Ipv4Addr>() {
                        macs.insert(ip, record.value_str().into_owned());
                    }
                }
                _ => {}
            }
        }
        for (ip, mac) in macs {
            if let Some(reservation) = reserved.get_mut(&ip) {
                reservation.mac = Some(mac);
            }
        }

        let now = Instant::now();
        state.unused = self
            .all_ips
            .iter()
            .filter(|ip| !reserved.contains_key(ip))
            .map(|ip| (*ip, now))
            .collect();
        state.reserved = reserved;
        Ok(())
    }

    /// The re-reserve ladder for a preferred address, first matching
    /// precondition wins: the key is absent; it is a bare reservation with
    /// the same MAC; a bare reservation with no MAC yet; any bare
    /// reservation.
    async fn try_rereserve(
        &self,
        ip: Ipv4Addr,
        mac: Option<&str>,
        kind: ReservationType,
    ) -> Result<bool> {
        if self.try_reserve_fresh(ip, mac, kind).await? {
            return Ok(true);
        }

        let ip_key = self.ip_key(ip);
        let mac_key = self.mac_key(ip);
        let reserved = ReservationType::Reserved.as_str().as_bytes().to_vec();

        let mut ladders: Vec<Vec<Compare>> = Vec::new();
        if let Some(mac) = mac {
            ladders.push(vec![
                Compare::ValueEq(ip_key.clone(), reserved.clone()),
                Compare::ValueEq(mac_key.clone(), mac.as_bytes().to_vec()),
            ]);
        }
        ladders.push(vec![
            Compare::ValueEq(ip_key.clone(), reserved.clone()),
            Compare::CreateRevisionEq(mac_key.clone(), 0),
        ]);
        ladders.push(vec![Compare::ValueEq(ip_key.clone(), reserved)]);

        for compares in ladders {
            let mut txn = TxnRequest::new();
            txn.compares = compares;
            txn = txn.then(TxnOp::Put(
                ip_key.clone(),
                kind.as_str().as_bytes().to_vec(),
            ));
            if let Some(mac) = mac {
                txn = txn.then(TxnOp::Put(mac_key.clone(), mac.as_bytes().to_vec()));
            }
            if self.client.txn(txn).await?.succeeded {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claim an address that must not exist yet.
    async fn try_reserve_fresh(
        &self,
        ip: Ipv4Addr,
        mac: Option<&str>,
        kind: ReservationType,
    ) -> Result<bool> {
        let ip_key = self.ip_key(ip);
        let mut txn = TxnRequest::new()
            .when(Compare::CreateRevisionEq(ip_key.clone(), 0))
            .then(TxnOp::Put(ip_key, kind.as_str().as_bytes().to_vec()));
        if let Some(mac) = mac {
            txn = txn.then(TxnOp::Put(self.mac_key(ip), mac.as_bytes().to_vec()));
        }
        Ok(self.client.txn(txn).await?.succeeded)
    }

    fn ip_key(&self, ip: Ipv4Addr) -> String {
        self.client.key(&[&ip.to_string()])
    }

    fn mac_key(&self, ip: Ipv4Addr) -> String {
        self.client.key(&[&ip.to_string(), "mac"])
    }

    /// Mirror reservation changes made by other hosts. Events that match
    /// the local state are echoes of our own writes and are ignored; the
    /// in-memory view stays authoritative for locally-initiated changes.
    async fn spawn_watcher(self: Arc<Self>) -> Result<()> {
        let mut watch = self.client.watch().await?;
        let pool = self;
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                pool.handle_watch_event(event).await;
            }
        });
        Ok(())
    }

    async fn handle_watch_event(&self, event: WatchEvent) {
        let segments: Vec<String> = match self.client.relative(event.key()) {
            Some(parts) => parts.into_iter().map(str::to_string).collect(),
            None => return,
        };
        let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
        match (parts.as_slice(), event) {
            ([raw_ip], WatchEvent::Put(record)) => {
                let Ok(ip) = raw_ip.parse::<Ipv4Addr>() else {
                    return;
                };
                let Some(kind) = ReservationType::parse(&record.value_str()) else {
                    warn!(pool = %self.pool_id, key = %record.key, "unknown reservation type in watch");
                    return;
                };
                let mut state = self.state.lock().await;
                match state.reserved.get_mut(&ip) {
                    Some(existing) if existing.kind == kind => {}
                    Some(existing) => {
                        debug!(pool = %self.pool_id, ip = %ip, from = %existing.kind, to = %kind,
                               "reservation type changed remotely");
                        existing.kind = kind;
                    }
                    None => {
                        state.unused.remove(&ip);
                        state.reserved.insert(ip, Reservation { kind, mac: None });
                    }
                }
            }
            ([raw_ip, "mac"], WatchEvent::Put(record)) => {
                let Ok(ip) = raw_ip.parse::<Ipv4Addr>() else {
                    return;
                };
                let mut state = self.state.lock().await;
                if let Some(reservation) = state.reserved.get_mut(&ip) {
                    reservation.mac = Some(record.value_str().into_owned());
                }
            }
            ([raw_ip], WatchEvent::Delete { .. }) => {
                let Ok(ip) = raw_ip.parse::<Ipv4Addr>() else {
                    return;
                };
                let mut state = self.state.lock().await;
                if state.reserved.remove(&ip).is_some() {
                    // Another host released this address, usually the IPAM
                    // first-pass entry once the container landed elsewhere.
                    state.unused.insert(ip, Instant::now());
                }
            }
            _ => {}
        }
    }

    #[cfg(test)]
    async fn backdate_unused(&self, ip: Ipv4Addr, age: Duration) {
        let mut state = self.state.lock().await;
        if let Some(freed_at) = state.unused.get_mut(&ip) {
            *freed_at = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::kv::KvClient;

    async fn pool() -> (Arc<AddressPool>, KvClient) {
        let root = KvClient::new(MemoryKv::shared(), "/flannel/networks/net1", vec![]);
        let client = root.sub(&["host-subnets", "10.1.0.0-29"]);
        let pool = AddressPool::new(
            "net1",
            "10.1.0.0/29".parse().unwrap(),
            "10.1.0.1".parse().unwrap(),
            client.clone(),
        )
        .await
        .unwrap();
        (pool, client)
    }

    #[tokio::test]
    async fn gateway_is_pre_reserved() {
        let (pool, client) = pool().await;
        let record = client.get(&["10.1.0.1"]).await.unwrap().unwrap();
        assert_eq!(record.value, b"reserved");

        // 5 other usable addresses remain (10.1.0.2 ..= 10.1.0.6).
        let reservations = pool.reservations().await;
        assert_eq!(reservations.len(), 1);
    }

    #[tokio::test]
    async fn sequential_allocation_picks_smallest() {
        let (pool, client) = pool().await;
        let ip = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        assert_eq!(ip.to_string(), "10.1.0.2");
        let record = client.get(&["10.1.0.2"]).await.unwrap().unwrap();
        assert_eq!(record.value, b"reserved");
    }

    #[tokio::test]
    async fn preferred_ip_with_mac_is_rereserved_in_place() {
        let (pool, client) = pool().await;
        // First-pass IPAM left a bare reservation behind.
        client.put(&["10.1.0.5"], "reserved").await.unwrap();

        let ip = pool
            .allocate_ip(
                Some("10.1.0.5".parse().unwrap()),
                Some("02:42:0a:01:00:05"),
                ReservationType::ContainerIp,
                false,
            )
            .await
            .unwrap();
        assert_eq!(ip.to_string(), "10.1.0.5");

        let record = client.get(&["10.1.0.5"]).await.unwrap().unwrap();
        assert_eq!(record.value, b"container-ip");
        let mac = client.get(&["10.1.0.5", "mac"]).await.unwrap().unwrap();
        assert_eq!(mac.value, b"02:42:0a:01:00:05");
    }

    #[tokio::test]
    async fn rereserve_refuses_foreign_mac() {
        let (pool, client) = pool().await;
        client.put(&["10.1.0.5"], "container-ip").await.unwrap();
        client
            .put(&["10.1.0.5", "mac"], "02:42:0a:01:00:99")
            .await
            .unwrap();

        // The address belongs to another container; the allocator must fall
        // back to a fresh address.
        let ip = pool
            .allocate_ip(
                Some("10.1.0.5".parse().unwrap()),
                Some("02:42:0a:01:00:05"),
                ReservationType::ContainerIp,
                false,
            )
            .await
            .unwrap();
        assert_ne!(ip.to_string(), "10.1.0.5");
    }

    #[tokio::test]
    async fn released_ip_is_held_back_while_alternatives_exist() {
        let (pool, _client) = pool().await;
        let first = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        pool.release_ip(first).await.unwrap();

        // Other addresses have aged past the hold; the freshly released one
        // has not and must lose to them.
        for ip in ["10.1.0.3", "10.1.0.4", "10.1.0.5", "10.1.0.6"] {
            pool.backdate_unused(ip.parse().unwrap(), REUSE_HOLD * 2).await;
        }
        let second = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        assert_ne!(second, first);
    }

    #[tokio::test]
    async fn fresh_releases_are_still_usable_when_nothing_else_is_free() {
        let root = KvClient::new(MemoryKv::shared(), "/flannel/networks/net2", vec![]);
        let client = root.sub(&["host-subnets", "10.2.0.0-30"]);
        // A /30 has two usable addresses; the gateway takes one.
        let pool = AddressPool::new(
            "net2",
            "10.2.0.0/30".parse().unwrap(),
            "10.2.0.1".parse().unwrap(),
            client,
        )
        .await
        .unwrap();

        let ip = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        pool.release_ip(ip).await.unwrap();

        let again = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        assert_eq!(again, ip);
    }

    #[tokio::test]
    async fn releasing_unreserved_ip_is_an_error() {
        let (pool, _client) = pool().await;
        let err = pool.release_ip("10.1.0.6".parse().unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn release_is_not_a_conflict_when_kv_entry_is_already_gone() {
        let (pool, client) = pool().await;
        let ip = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        // Another host cleaned the entry up concurrently. Depending on
        // whether the watcher mirrored the delete first, release either
        // succeeds or reports the reservation as gone; it must not fail
        // with a conflict, and the address must end up unreserved.
        client.delete(&[&ip.to_string()]).await.unwrap();

        match pool.release_ip(ip).await {
            Ok(()) | Err(DriverError::NotFound { .. }) => {}
            Err(other) => panic!("unexpected release failure: {other}"),
        }
        assert!(!pool.reservations().await.contains_key(&ip));
    }

    #[tokio::test]
    async fn exhausted_pool_reports_no_free_addresses() {
        let root = KvClient::new(MemoryKv::shared(), "/flannel/networks/net3", vec![]);
        let client = root.sub(&["host-subnets", "10.3.0.0-30"]);
        let pool = AddressPool::new(
            "net3",
            "10.3.0.0/30".parse().unwrap(),
            "10.3.0.1".parse().unwrap(),
            client,
        )
        .await
        .unwrap();

        pool.allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();
        let err = pool
            .allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Exhausted(_)));
    }

    #[tokio::test]
    async fn release_all_clears_kv_and_reinstates_gateway() {
        let (pool, client) = pool().await;
        pool.allocate_ip(None, None, ReservationType::Reserved, false)
            .await
            .unwrap();

        pool.release_all_ips().await.unwrap();

        let records = client.get_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].key.ends_with("/10.1.0.1"));
    }
}
