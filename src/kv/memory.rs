//! In-process KV backend.
//!
//! Implements the same revision model the etcd backend exposes: a global
//! revision counter, per-key create/mod revisions and versions, atomic
//! transaction evaluation and watch fan-out in revision order. The test
//! suite and local development run entirely against this backend.

use crate::core::error::Result;
use crate::kv::txn::{TxnOp, TxnOutcome, TxnRequest};
use crate::kv::{Kv, KeyValue, SharedKv, WatchEvent, WatchStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    revision: i64,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn record(&self, key: &str) -> Option<KeyValue> {
        self.entries.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
            version: entry.version,
        })
    }

    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.revision += 1;
        let revision = self.revision;
        let entry = self
            .entries
            .entry(key.to_string())
            .and_modify(|entry| {
                entry.value = value.clone();
                entry.mod_revision = revision;
                entry.version += 1;
            })
            .or_insert(Entry {
                value,
                create_revision: revision,
                mod_revision: revision,
                version: 1,
            });
        let record = KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
            version: entry.version,
        };
        self.notify(WatchEvent::Put(record));
    }

    fn delete(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.revision += 1;
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
                mod_revision: self.revision,
            });
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if !event.key().starts_with(watcher.prefix.as_str()) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(event.clone()).is_ok()
        });
    }
}

/// In-memory [`Kv`] backend.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedKv {
        Arc::new(Self::new())
    }

    /// Current global revision, exposed for tests.
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.inner.lock().record(key))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| inner.record(key).expect("entry present while locked"))
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.lock().put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().delete(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            inner.delete(&key);
        }
        Ok(())
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnOutcome> {
        let mut inner = self.inner.lock();
        let succeeded = request
            .compares
            .iter()
            .all(|compare| compare.evaluate(inner.record(compare.key()).as_ref()));

        let branch = if succeeded {
            &request.success
        } else {
            &request.failure
        };

        let mut fetched = Vec::new();
        for op in branch {
            match op {
                TxnOp::Put(key, value) => inner.put(key, value.clone()),
                TxnOp::Delete(key) => inner.delete(key),
                TxnOp::Get(key) => fetched.push(inner.record(key)),
            }
        }

        Ok(TxnOutcome { succeeded, fetched })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::txn::Compare;

    #[tokio::test]
    async fn revisions_track_creation_and_modification() {
        let kv = MemoryKv::new();
        kv.put("a", b"1".to_vec()).await.unwrap();
        kv.put("a", b"2".to_vec()).await.unwrap();

        let record = kv.get("a").await.unwrap().unwrap();
        assert_eq!(record.create_revision, 1);
        assert_eq!(record.mod_revision, 2);
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn delete_of_absent_key_does_not_bump_revision() {
        let kv = MemoryKv::new();
        kv.delete("nope").await.unwrap();
        assert_eq!(kv.revision(), 0);
    }

    #[tokio::test]
    async fn txn_failure_branch_runs_gets() {
        let kv = MemoryKv::new();
        kv.put("lease", b"net1".to_vec()).await.unwrap();

        let outcome = kv
            .txn(
                TxnRequest::new()
                    .when(Compare::CreateRevisionEq("lease".into(), 0))
                    .then(TxnOp::Put("lease".into(), b"net2".to_vec()))
                    .or_else(TxnOp::Get("lease".into())),
            )
            .await
            .unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.first_fetched().unwrap().value, b"net1");
        // The losing branch must not have overwritten the lease.
        assert_eq!(kv.get("lease").await.unwrap().unwrap().value, b"net1");
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_under_prefix_only() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch_prefix("/pool/").await.unwrap();

        kv.put("/pool/10.1.0.5", b"container-ip".to_vec())
            .await
            .unwrap();
        kv.put("/other/k", b"x".to_vec()).await.unwrap();
        kv.delete("/pool/10.1.0.5").await.unwrap();

        match watch.recv().await.unwrap() {
            WatchEvent::Put(record) => assert_eq!(record.key, "/pool/10.1.0.5"),
            other => panic!("unexpected event {other:?}"),
        }
        match watch.recv().await.unwrap() {
            WatchEvent::Delete { key, .. } => assert_eq!(key, "/pool/10.1.0.5"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
