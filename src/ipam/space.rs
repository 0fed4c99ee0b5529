//! Cluster-wide pool subnet leasing.
//!
//! The address space is the union of the operator supernets, carved into
//! pool subnets of `NETWORK_SUBNET_SIZE`. Each lease is one KV entry
//! `address-space/<subnet-key> -> <flannel-id>`; first-writer-wins
//! transactions keep a subnet leased at most once cluster-wide.

use crate::core::error::{DriverError, Result};
use crate::ipam::subnet::{key_to_subnet, pool_candidates, subnet_to_key};
use crate::kv::{Compare, KvClient, TxnOp, TxnRequest};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use tracing::{debug, info};

pub struct AddressSpace {
    client: KvClient,
    supernets: Vec<Ipv4Net>,
    pool_prefix: u8,
}

impl AddressSpace {
    pub fn new(client: KvClient, supernets: Vec<Ipv4Net>, pool_prefix: u8) -> Self {
        Self {
            client,
            supernets,
            pool_prefix,
        }
    }

    /// Subnets currently leased, as `flannel-id -> subnet`.
    pub async fn leased_pools(&self) -> Result<HashMap<String, Ipv4Net>> {
        let mut result = HashMap::new();
        for record in self.client.get_all().await? {
            let Some(parts) = self.client.relative(&record.key) else {
                continue;
            };
            let [subnet_key] = parts.as_slice() else {
                continue;
            };
            match key_to_subnet(subnet_key) {
                Some(subnet) => {
                    result.insert(record.value_str().into_owned(), subnet);
                }
                None => debug!(key = %record.key, "skipping unparsable subnet lease"),
            }
        }
        Ok(result)
    }

    /// Return the pool already leased to `flannel_id`, or lease the first
    /// free candidate. Exhaustion of the full enumeration is an error and is
    /// not retried.
    pub async fn get_new_or_existing_pool(&self, flannel_id: &str) -> Result<Ipv4Net> {
        let leased = self.leased_pools().await?;
        if let Some(subnet) = leased.get(flannel_id) {
            return Ok(*subnet);
        }
        let taken: std::collections::HashSet<Ipv4Net> = leased.into_values().collect();

        for candidate in pool_candidates(&self.supernets, self.pool_prefix) {
            if taken.contains(&candidate) {
                continue;
            }

            let key = self.client.key(&[&subnet_to_key(&candidate)]);
            let outcome = self
                .client
                .txn(
                    TxnRequest::new()
                        .when(Compare::CreateRevisionEq(key.clone(), 0))
                        .then(TxnOp::Put(key.clone(), flannel_id.as_bytes().to_vec()))
                        .or_else(TxnOp::Get(key)),
                )
                .await?;

            if outcome.succeeded {
                info!(flannel_id, pool = %candidate, "leased pool subnet");
                return Ok(candidate);
            }
            // Another allocator raced us to this subnet. Reuse it only if it
            // went to the same network.
            if let Some(existing) = outcome.first_fetched() {
                if existing.value == flannel_id.as_bytes() {
                    return Ok(candidate);
                }
            }
        }

        Err(DriverError::Exhausted(format!(
            "no free pool subnet left for network {flannel_id}"
        )))
    }

    /// Drop the lease held by `flannel_id`. Succeeds when the lease is
    /// already gone.
    pub async fn release_pool(&self, flannel_id: &str) -> Result<()> {
        let leased = self.leased_pools().await?;
        let Some(subnet) = leased.get(flannel_id) else {
            return Ok(());
        };

        let released = self
            .client
            .compare_value_and_delete(&[&subnet_to_key(subnet)], flannel_id.as_bytes().to_vec())
            .await?;
        if released {
            info!(flannel_id, pool = %subnet, "released pool subnet");
            return Ok(());
        }
        // Lost the compare: either deleted concurrently (fine) or re-leased
        // to someone else (also fine to leave alone).
        if self.client.get(&[&subnet_to_key(subnet)]).await?.is_none() {
            return Ok(());
        }
        debug!(flannel_id, pool = %subnet, "pool lease changed owner, leaving it");
        Ok(())
    }
}
