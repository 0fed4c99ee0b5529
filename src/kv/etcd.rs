//! etcd v3 backend.
//!
//! Thin translation of the [`Kv`](crate::kv::Kv) trait onto `etcd-client`.
//! Request-path operations inherit the 5 second per-operation deadline from
//! the connection options. Watches run on a background task that reconnects
//! forever with a fixed backoff, resuming from the last delivered revision
//! so no events are lost across reconnects.

use crate::core::config::KV_TIMEOUT;
use crate::core::error::Result;
use crate::kv::txn::{Compare, TxnOp, TxnOutcome, TxnRequest};
use crate::kv::{Kv, KeyValue, SharedKv, WatchEvent, WatchStream};
use async_trait::async_trait;
use etcd_client::{
    Client, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, Txn,
    TxnOp as EtcdTxnOp, TxnOpResponse, WatchOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const WATCH_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// etcd-backed [`Kv`] implementation.
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Dial the given endpoints. The connection itself is lazy; the startup
    /// retry loop probes it before anything else runs.
    pub async fn connect(endpoints: &[String]) -> Result<SharedKv> {
        let options = ConnectOptions::new()
            .with_connect_timeout(KV_TIMEOUT)
            .with_timeout(KV_TIMEOUT)
            .with_keep_alive(Duration::from_secs(10), KV_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Arc::new(Self { client }))
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
    }
}

fn convert_compare(compare: Compare) -> etcd_client::Compare {
    match compare {
        Compare::CreateRevisionEq(key, revision) => {
            etcd_client::Compare::create_revision(key, CompareOp::Equal, revision)
        }
        Compare::ModRevisionEq(key, revision) => {
            etcd_client::Compare::mod_revision(key, CompareOp::Equal, revision)
        }
        Compare::ValueEq(key, value) => etcd_client::Compare::value(key, CompareOp::Equal, value),
        Compare::ValueNe(key, value) => {
            etcd_client::Compare::value(key, CompareOp::NotEqual, value)
        }
    }
}

fn convert_ops(ops: Vec<TxnOp>) -> Vec<EtcdTxnOp> {
    ops.into_iter()
        .map(|op| match op {
            TxnOp::Put(key, value) => EtcdTxnOp::put(key, value, None),
            TxnOp::Delete(key) => EtcdTxnOp::delete(key, None),
            TxnOp::Get(key) => EtcdTxnOp::get(key, None),
        })
        .collect()
}

#[async_trait]
impl Kv for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.kv_client();
        let response = client.get(key, None).await?;
        Ok(response.kvs().first().map(convert_kv))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.kv_client();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(response.kvs().iter().map(convert_kv).collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.kv_client();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.kv_client();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.kv_client();
        client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnOutcome> {
        let txn = Txn::new()
            .when(
                request
                    .compares
                    .into_iter()
                    .map(convert_compare)
                    .collect::<Vec<_>>(),
            )
            .and_then(convert_ops(request.success))
            .or_else(convert_ops(request.failure));

        let mut client = self.client.kv_client();
        let response = client.txn(txn).await?;

        let fetched = response
            .op_responses()
            .into_iter()
            .filter_map(|op| match op {
                TxnOpResponse::Get(get) => Some(get.kvs().first().map(convert_kv)),
                _ => None,
            })
            .collect();

        Ok(TxnOutcome {
            succeeded: response.succeeded(),
            fetched,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            // Revision to resume from after a reconnect. 0 means "current".
            let mut next_revision: i64 = 0;
            loop {
                let mut options = WatchOptions::new().with_prefix();
                if next_revision > 0 {
                    options = options.with_start_revision(next_revision);
                }

                let mut watch_client = client.watch_client();
                match watch_client.watch(prefix.as_str(), Some(options)).await {
                    Ok((_watcher, mut stream)) => loop {
                        match stream.message().await {
                            Ok(Some(response)) => {
                                next_revision =
                                    next_revision.max(response.header().map_or(0, |h| h.revision()) + 1);
                                for event in response.events() {
                                    let Some(kv) = event.kv() else { continue };
                                    let mapped = match event.event_type() {
                                        EventType::Put => WatchEvent::Put(convert_kv(kv)),
                                        EventType::Delete => WatchEvent::Delete {
                                            key: String::from_utf8_lossy(kv.key()).into_owned(),
                                            mod_revision: kv.mod_revision(),
                                        },
                                    };
                                    if tx.send(mapped).is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(prefix = %prefix, error = %err, "watch stream failed");
                                break;
                            }
                        }
                    },
                    Err(err) => {
                        warn!(prefix = %prefix, error = %err, "watch open failed");
                    }
                }

                if tx.is_closed() {
                    return;
                }
                debug!(prefix = %prefix, "reconnecting watch");
                tokio::time::sleep(WATCH_RECONNECT_BACKOFF).await;
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn probe(&self) -> Result<()> {
        let mut client = self.client.kv_client();
        client.get("\u{0}", None).await?;
        Ok(())
    }
}
