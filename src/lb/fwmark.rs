//! Firewall-mark allocation.
//!
//! IPVS dispatches on a 32-bit packet mark, so every `(service, network)`
//! pair gets exactly one. Marks derive from `CRC32(service-network)`; on a
//! collision with an already-reserved mark a random hex suffix is appended
//! and the hash retried. The KV keeps two views that must agree:
//! `<network>/list/<fwmark> -> service` and
//! `<network>/by-service/<service> -> fwmark`, written atomically.

use crate::core::error::{DriverError, Result};
use crate::kv::{Compare, KvClient, TxnOp, TxnRequest};
use rand::RngCore;
use std::collections::HashSet;
use tracing::{debug, info, warn};

const MAX_GENERATION_ATTEMPTS: usize = 1000;
const COLLISION_SUFFIX_BYTES: usize = 4;

/// Derive a mark for the pair that collides with none of `existing`.
pub fn generate_fwmark(
    service_id: &str,
    network_id: &str,
    existing: &HashSet<u32>,
) -> Result<u32> {
    let mut current = format!("{service_id}-{network_id}");
    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let fwmark = crc32fast::hash(current.as_bytes());
        if !existing.contains(&fwmark) {
            return Ok(fwmark);
        }
        let mut suffix = [0u8; COLLISION_SUFFIX_BYTES];
        rand::thread_rng().fill_bytes(&mut suffix);
        current = format!("{service_id}_{}", hex::encode(suffix));
    }
    Err(DriverError::Exhausted(format!(
        "no collision-free fwmark for service {service_id} on network {network_id}"
    )))
}

/// KV-backed fwmark bookkeeping under the `service-lbs` prefix.
pub struct FwmarkAllocator {
    client: KvClient,
}

impl FwmarkAllocator {
    pub fn new(client: KvClient) -> Self {
        Self { client }
    }

    /// Return the mark already assigned to the pair, or assign a fresh one.
    pub async fn get(&self, service_id: &str, network_id: &str) -> Result<u32> {
        if let Some(record) = self.client.get(&[network_id, "by-service", service_id]).await? {
            match record.value_str().parse::<u32>() {
                Ok(fwmark) => return Ok(fwmark),
                Err(err) => {
                    warn!(service_id, network_id, error = %err, "discarding unparsable fwmark")
                }
            }
        }

        let list = self.client.sub(&[network_id, "list"]);
        loop {
            let mut existing = HashSet::new();
            for record in list.get_all().await? {
                let Some(parts) = list.relative(&record.key) else {
                    continue;
                };
                let [raw] = parts.as_slice() else { continue };
                match raw.parse::<u32>() {
                    Ok(fwmark) => {
                        existing.insert(fwmark);
                    }
                    Err(err) => warn!(key = %record.key, error = %err, "skipping unparsable fwmark"),
                }
            }

            let fwmark = generate_fwmark(service_id, network_id, &existing)?;
            let fwmark_str = fwmark.to_string();
            let fwmark_key = self.client.key(&[network_id, "list", &fwmark_str]);
            let service_key = self.client.key(&[network_id, "by-service", service_id]);

            let outcome = self
                .client
                .txn(
                    TxnRequest::new()
                        .when(Compare::CreateRevisionEq(fwmark_key.clone(), 0))
                        .then(TxnOp::Put(service_key, fwmark_str.into_bytes()))
                        .then(TxnOp::Put(fwmark_key, service_id.as_bytes().to_vec())),
                )
                .await?;
            if outcome.succeeded {
                info!(service_id, network_id, fwmark, "assigned fwmark");
                return Ok(fwmark);
            }
            // Someone registered this mark since we listed; rebuild the set.
            debug!(service_id, network_id, fwmark, "fwmark raced, retrying");
        }
    }

    /// Drop both views of the assignment, guarded so a re-assigned mark is
    /// never deleted from under its new owner.
    pub async fn release(&self, service_id: &str, network_id: &str, fwmark: u32) -> Result<()> {
        let fwmark_str = fwmark.to_string();
        let fwmark_key = self.client.key(&[network_id, "list", &fwmark_str]);
        let service_key = self.client.key(&[network_id, "by-service", service_id]);

        let outcome = self
            .client
            .txn(
                TxnRequest::new()
                    .when(Compare::ValueEq(
                        service_key.clone(),
                        fwmark_str.as_bytes().to_vec(),
                    ))
                    .when(Compare::ValueEq(
                        fwmark_key.clone(),
                        service_id.as_bytes().to_vec(),
                    ))
                    .then(TxnOp::Delete(service_key))
                    .then(TxnOp::Delete(fwmark_key)),
            )
            .await?;
        if !outcome.succeeded {
            return Err(DriverError::Conflict(format!(
                "fwmark {fwmark} for service {service_id} on network {network_id} does not match"
            )));
        }
        Ok(())
    }

    /// Remove every fwmark entry whose service is not in `known_services`.
    /// Returns the `(network, fwmark)` pairs that were dropped.
    pub async fn cleanup_stale(
        &self,
        known_services: &HashSet<String>,
    ) -> Result<Vec<(String, u32)>> {
        let mut dropped = Vec::new();
        for record in self.client.get_all().await? {
            let Some(parts) = self.client.relative(&record.key) else {
                continue;
            };
            let (network_id, service_id, fwmark_str) = match parts.as_slice() {
                [network_id, "by-service", service_id] => {
                    (*network_id, service_id.to_string(), record.value_str().into_owned())
                }
                [network_id, "list", fwmark] => {
                    (*network_id, record.value_str().into_owned(), fwmark.to_string())
                }
                _ => {
                    debug!(key = %record.key, "ignoring unknown service-lb key");
                    continue;
                }
            };
            if known_services.contains(&service_id) {
                continue;
            }

            info!(service_id, network_id, "dropping stale fwmark entry");
            self.client.backend().delete(&record.key).await?;
            if let Ok(fwmark) = fwmark_str.parse::<u32>() {
                dropped.push((network_id.to_string(), fwmark));
            }
        }
        Ok(dropped)
    }

    /// Drop every entry of one network, used when the network is removed.
    pub async fn drop_network(&self, network_id: &str) -> Result<()> {
        self.client.sub(&[network_id]).delete_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;

    fn allocator() -> FwmarkAllocator {
        FwmarkAllocator::new(KvClient::new(MemoryKv::shared(), "/flannel/service-lbs", vec![]))
    }

    #[test]
    fn generation_is_deterministic_without_collisions() {
        let a = generate_fwmark("svc1", "net1", &HashSet::new()).unwrap();
        let b = generate_fwmark("svc1", "net1", &HashSet::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, crc32fast::hash(b"svc1-net1"));
    }

    #[test]
    fn generation_escapes_collisions() {
        let primary = crc32fast::hash(b"svc1-net1");
        let existing: HashSet<u32> = [primary].into();
        let fwmark = generate_fwmark("svc1", "net1", &existing).unwrap();
        assert_ne!(fwmark, primary);
    }

    #[tokio::test]
    async fn get_is_stable_per_pair_and_views_agree() {
        let allocator = allocator();
        let first = allocator.get("svc1", "net1").await.unwrap();
        let second = allocator.get("svc1", "net1").await.unwrap();
        assert_eq!(first, second);

        let list = allocator
            .client
            .get(&["net1", "list", &first.to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(list.value, b"svc1");
        let by_service = allocator
            .client
            .get(&["net1", "by-service", "svc1"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_service.value, first.to_string().as_bytes());
    }

    #[tokio::test]
    async fn distinct_pairs_get_distinct_marks() {
        let allocator = allocator();
        let a = allocator.get("svc1", "net1").await.unwrap();
        let b = allocator.get("svc1", "net2").await.unwrap();
        let c = allocator.get("svc2", "net1").await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn release_removes_both_views() {
        let allocator = allocator();
        let fwmark = allocator.get("svc1", "net1").await.unwrap();
        allocator.release("svc1", "net1", fwmark).await.unwrap();

        assert!(allocator
            .client
            .get(&["net1", "by-service", "svc1"])
            .await
            .unwrap()
            .is_none());
        assert!(allocator
            .client
            .get(&["net1", "list", &fwmark.to_string()])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn release_refuses_mismatched_mark() {
        let allocator = allocator();
        let fwmark = allocator.get("svc1", "net1").await.unwrap();
        let err = allocator
            .release("svc1", "net1", fwmark.wrapping_add(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Conflict(_)));
    }

    #[tokio::test]
    async fn cleanup_drops_only_unknown_services() {
        let allocator = allocator();
        let keep = allocator.get("svc-alive", "net1").await.unwrap();
        let drop = allocator.get("svc-dead", "net1").await.unwrap();

        let known: HashSet<String> = ["svc-alive".to_string()].into();
        let dropped = allocator.cleanup_stale(&known).await.unwrap();

        assert!(dropped.iter().any(|(_, fwmark)| *fwmark == drop));
        assert_eq!(allocator.get("svc-alive", "net1").await.unwrap(), keep);
        assert!(allocator
            .client
            .get(&["net1", "by-service", "svc-dead"])
            .await
            .unwrap()
            .is_none());
    }
}
