//! Coordination-store abstraction.
//!
//! Everything cluster-shared goes through the [`Kv`] trait: a prefix-ranged
//! key-value surface with create/mod revisions, compare-and-swap
//! transactions and prefix watches. Production uses the [`etcd::EtcdKv`]
//! backend; tests and local development use [`memory::MemoryKv`], which
//! implements the same revision semantics in process.
//!
//! [`KvClient`] layers prefix scoping and the handful of conditional-write
//! helpers the allocator and the distributed stores are built from.

pub mod etcd;
pub mod memory;
pub mod txn;

use crate::core::error::{DriverError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use txn::{Compare, TxnOp, TxnOutcome, TxnRequest};

/// A stored record with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created. 0 only for absent keys.
    pub create_revision: i64,
    /// Revision of the last modification.
    pub mod_revision: i64,
    /// Number of modifications since creation.
    pub version: i64,
}

impl KeyValue {
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// A single change observed by a prefix watch, in revision order.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }
}

/// Receiving side of a prefix watch.
///
/// Backends own the producing task; disconnects are reconnected internally
/// and never surface here. The stream ends only when the backend shuts down.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// The coordination-store surface the driver is written against.
#[async_trait]
pub trait Kv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All records whose key starts with `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Execute a compare/then/else transaction atomically.
    async fn txn(&self, request: TxnRequest) -> Result<TxnOutcome>;

    /// Open a long-lived watch over `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    /// Cheap liveness probe used by the startup retry loop.
    async fn probe(&self) -> Result<()>;
}

pub type SharedKv = Arc<dyn Kv>;

/// Prefix-scoped handle over a [`Kv`] backend.
///
/// Sub-clients share the backend connection and narrow the prefix, which is
/// how each subsystem gets its own slice of the tree without ever seeing
/// sibling keys.
#[derive(Clone)]
pub struct KvClient {
    kv: SharedKv,
    prefix: String,
    endpoints: Vec<String>,
}

impl KvClient {
    pub fn new(kv: SharedKv, prefix: impl Into<String>, endpoints: Vec<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self {
            kv,
            prefix,
            endpoints,
        }
    }

    /// Absolute key for the given path segments under this client's prefix.
    pub fn key(&self, parts: &[&str]) -> String {
        if parts.is_empty() {
            return self.prefix.clone();
        }
        format!("{}/{}", self.prefix, parts.join("/"))
    }

    /// New client scoped one or more segments deeper.
    pub fn sub(&self, parts: &[&str]) -> KvClient {
        KvClient {
            kv: self.kv.clone(),
            prefix: self.key(parts),
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Endpoints the backend dials; handed to the VXLAN daemon verbatim.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn backend(&self) -> &SharedKv {
        &self.kv
    }

    /// Strip this client's prefix from an absolute key, returning the
    /// relative segments. `None` when the key is outside the prefix.
    pub fn relative<'a>(&self, key: &'a str) -> Option<Vec<&'a str>> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        if rest.is_empty() {
            return Some(Vec::new());
        }
        Some(rest.split('/').collect())
    }

    pub async fn get(&self, parts: &[&str]) -> Result<Option<KeyValue>> {
        self.kv.get(&self.key(parts)).await
    }

    pub async fn get_all(&self) -> Result<Vec<KeyValue>> {
        self.kv.get_prefix(&self.prefix).await
    }

    pub async fn put(&self, parts: &[&str], value: impl Into<Vec<u8>>) -> Result<()> {
        self.kv.put(&self.key(parts), value.into()).await
    }

    pub async fn delete(&self, parts: &[&str]) -> Result<()> {
        self.kv.delete(&self.key(parts)).await
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.kv.delete_prefix(&self.prefix).await
    }

    pub async fn txn(&self, request: TxnRequest) -> Result<TxnOutcome> {
        self.kv.txn(request).await
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        self.kv.watch_prefix(&self.prefix).await
    }

    /// Put the key only when it does not exist yet. Returns whether the
    /// write happened.
    pub async fn put_if_absent(&self, parts: &[&str], value: impl Into<Vec<u8>>) -> Result<bool> {
        let key = self.key(parts);
        let outcome = self
            .kv
            .txn(
                TxnRequest::new()
                    .when(Compare::CreateRevisionEq(key.clone(), 0))
                    .then(TxnOp::Put(key, value.into())),
            )
            .await?;
        Ok(outcome.succeeded)
    }

    /// Put the key unless it already holds exactly these bytes. Returns
    /// whether a write happened (i.e. the value was new or different).
    pub async fn put_if_new_or_changed(
        &self,
        parts: &[&str],
        value: impl Into<Vec<u8>>,
    ) -> Result<bool> {
        let key = self.key(parts);
        let value = value.into();
        let outcome = self
            .kv
            .txn(
                TxnRequest::new()
                    .when(Compare::ValueEq(key.clone(), value.clone()))
                    .or_else(TxnOp::Put(key, value)),
            )
            .await?;
        // The success branch means the stored value already matched.
        Ok(!outcome.succeeded)
    }

    /// Delete the key only while it holds `expected`. Returns whether the
    /// transaction took the delete branch.
    pub async fn compare_value_and_delete(
        &self,
        parts: &[&str],
        expected: impl Into<Vec<u8>>,
    ) -> Result<bool> {
        let key = self.key(parts);
        let outcome = self
            .kv
            .txn(
                TxnRequest::new()
                    .when(Compare::ValueEq(key.clone(), expected.into()))
                    .then(TxnOp::Delete(key)),
            )
            .await?;
        Ok(outcome.succeeded)
    }

    /// Block until the backend answers a probe, retrying `attempts` times
    /// with `interval` between tries. Startup aborts when this fails.
    pub async fn wait_until_available(&self, interval: Duration, attempts: u32) -> Result<()> {
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.kv.probe().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "kv store not reachable yet");
                    last = err.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(DriverError::Kv(format!(
            "unreachable after {attempts} attempts: {last}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;

    fn client() -> KvClient {
        KvClient::new(MemoryKv::shared(), "/flannel", vec!["mem://".into()])
    }

    #[test]
    fn key_joins_segments_under_prefix() {
        let root = client();
        assert_eq!(root.key(&[]), "/flannel");
        assert_eq!(root.key(&["networks", "net1"]), "/flannel/networks/net1");
        let sub = root.sub(&["networks"]);
        assert_eq!(sub.key(&["net1", "config"]), "/flannel/networks/net1/config");
    }

    #[test]
    fn relative_strips_prefix() {
        let root = client().sub(&["pool"]);
        assert_eq!(
            root.relative("/flannel/pool/10.1.0.5/mac"),
            Some(vec!["10.1.0.5", "mac"])
        );
        assert_eq!(root.relative("/other/10.1.0.5"), None);
    }

    #[tokio::test]
    async fn put_if_absent_is_first_writer_wins() {
        let c = client();
        assert!(c.put_if_absent(&["lease"], "a").await.unwrap());
        assert!(!c.put_if_absent(&["lease"], "b").await.unwrap());
        let kv = c.get(&["lease"]).await.unwrap().unwrap();
        assert_eq!(kv.value, b"a");
    }

    #[tokio::test]
    async fn put_if_new_or_changed_skips_identical_values() {
        let c = client();
        assert!(c.put_if_new_or_changed(&["item"], "v1").await.unwrap());
        assert!(!c.put_if_new_or_changed(&["item"], "v1").await.unwrap());
        assert!(c.put_if_new_or_changed(&["item"], "v2").await.unwrap());
    }

    #[tokio::test]
    async fn compare_value_and_delete_requires_match() {
        let c = client();
        c.put(&["lease"], "net1").await.unwrap();
        assert!(!c.compare_value_and_delete(&["lease"], "net2").await.unwrap());
        assert!(c.compare_value_and_delete(&["lease"], "net1").await.unwrap());
        assert!(c.get(&["lease"]).await.unwrap().is_none());
    }
}
