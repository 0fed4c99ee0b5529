//! Distributed store tests.

mod common;

use flannel_np::store::sharded::ShardedStore;
use flannel_np::store::unsharded::{DistributedStore, StoreRole};
use flannel_np::store::{Handlers, ShardHandlers};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    value: String,
}

fn item(value: &str) -> Item {
    Item {
        value: value.into(),
    }
}

#[derive(Default)]
struct Counters {
    added: AtomicUsize,
    changed: AtomicUsize,
    removed: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.added.load(Ordering::SeqCst),
            self.changed.load(Ordering::SeqCst),
            self.removed.load(Ordering::SeqCst),
        )
    }
}

fn counting_handlers(counters: &Arc<Counters>) -> Handlers<Item> {
    let added = counters.clone();
    let changed = counters.clone();
    let removed = counters.clone();
    Handlers::new()
        .on_added(move |items| {
            added.added.fetch_add(items.len(), Ordering::SeqCst);
        })
        .on_changed(move |items| {
            changed.changed.fetch_add(items.len(), Ordering::SeqCst);
        })
        .on_removed(move |items| {
            removed.removed.fetch_add(items.len(), Ordering::SeqCst);
        })
}

fn counting_shard_handlers(counters: &Arc<Counters>) -> ShardHandlers<Item> {
    let added = counters.clone();
    let changed = counters.clone();
    let removed = counters.clone();
    ShardHandlers::new()
        .on_added(move |items| {
            added.added.fetch_add(items.len(), Ordering::SeqCst);
        })
        .on_changed(move |items| {
            changed.changed.fetch_add(items.len(), Ordering::SeqCst);
        })
        .on_removed(move |items| {
            removed.removed.fetch_add(items.len(), Ordering::SeqCst);
        })
}

/// Watch events are delivered from a background task; give them a moment.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Unsharded store
// ============================================================================

#[tokio::test]
async fn add_update_delete_fire_the_matching_callbacks() {
    let counters = Arc::new(Counters::default());
    let store = DistributedStore::new(
        common::memory_client("/t/networks"),
        StoreRole::Writer,
        counting_handlers(&counters),
    );
    store.clone().init(None).await.unwrap();

    store.add_or_update("a", item("1")).await.unwrap();
    store.add_or_update("a", item("2")).await.unwrap();
    store.add_or_update("a", item("2")).await.unwrap(); // identical, silent
    store.delete("a").await.unwrap();
    store.delete("a").await.unwrap(); // already gone, silent

    settle().await;
    assert_eq!(counters.snapshot(), (1, 1, 1));
}

#[tokio::test]
async fn sync_twice_with_identical_truth_is_silent_the_second_time() {
    let counters = Arc::new(Counters::default());
    let store = DistributedStore::new(
        common::memory_client("/t/networks"),
        StoreRole::Writer,
        counting_handlers(&counters),
    );
    store.clone().init(None).await.unwrap();

    let truth = HashMap::from([("a".to_string(), item("1")), ("b".to_string(), item("2"))]);
    store.sync(truth.clone()).await.unwrap();
    assert_eq!(counters.snapshot(), (2, 0, 0));

    store.sync(truth).await.unwrap();
    settle().await;
    assert_eq!(counters.snapshot(), (2, 0, 0));
}

#[tokio::test]
async fn sync_computes_added_changed_removed() {
    let counters = Arc::new(Counters::default());
    let store = DistributedStore::new(
        common::memory_client("/t/networks"),
        StoreRole::Writer,
        counting_handlers(&counters),
    );
    store.clone().init(None).await.unwrap();
    store
        .sync(HashMap::from([
            ("keep".to_string(), item("1")),
            ("change".to_string(), item("1")),
            ("drop".to_string(), item("1")),
        ]))
        .await
        .unwrap();

    store
        .sync(HashMap::from([
            ("keep".to_string(), item("1")),
            ("change".to_string(), item("2")),
            ("new".to_string(), item("1")),
        ]))
        .await
        .unwrap();

    settle().await;
    assert_eq!(counters.snapshot(), (3 + 1, 1, 1));
}

#[tokio::test]
async fn reader_follows_a_writer_through_the_watch() {
    let (writer_client, reader_client) = common::shared_memory_clients("/t/networks");

    let writer_counters = Arc::new(Counters::default());
    let writer = DistributedStore::new(
        writer_client,
        StoreRole::Writer,
        counting_handlers(&writer_counters),
    );
    writer.clone().init(None).await.unwrap();

    let reader_counters = Arc::new(Counters::default());
    let reader = DistributedStore::new(
        reader_client,
        StoreRole::Reader,
        counting_handlers(&reader_counters),
    );
    reader.clone().init(None).await.unwrap();

    writer.add_or_update("a", item("1")).await.unwrap();
    settle().await;

    assert_eq!(reader.get("a"), Some(item("1")));
    assert_eq!(reader_counters.snapshot(), (1, 0, 0));

    writer.delete("a").await.unwrap();
    settle().await;
    assert_eq!(reader.get("a"), None);
    assert_eq!(reader_counters.snapshot(), (1, 0, 1));
}

// ============================================================================
// Sharded store
// ============================================================================

#[tokio::test]
async fn local_writes_fire_once_despite_the_watch_echo() {
    let counters = Arc::new(Counters::default());
    let store = ShardedStore::new(
        common::memory_client("/t/containers"),
        "host-a",
        counting_shard_handlers(&counters),
    );
    store.clone().init(HashMap::new()).await.unwrap();

    store.add_or_update("c1", item("1")).await.unwrap();
    settle().await;

    // The local write already fired its callback synchronously; the watch
    // echo from the local shard must be suppressed.
    assert_eq!(counters.snapshot(), (1, 0, 0));
    let (shard, value) = store.get("c1").unwrap();
    assert_eq!(shard, "host-a");
    assert_eq!(value, item("1"));
}

#[tokio::test]
async fn remote_shard_changes_fan_in_through_the_watch() {
    let (client_a, client_b) = common::shared_memory_clients("/t/containers");

    let counters_a = Arc::new(Counters::default());
    let store_a = ShardedStore::new(client_a, "host-a", counting_shard_handlers(&counters_a));
    store_a.clone().init(HashMap::new()).await.unwrap();

    let store_b = ShardedStore::new(client_b, "host-b", ShardHandlers::new());
    store_b.clone().init(HashMap::new()).await.unwrap();

    store_b.add_or_update("c-remote", item("1")).await.unwrap();
    settle().await;

    let (shard, value) = store_a.get("c-remote").unwrap();
    assert_eq!(shard, "host-b");
    assert_eq!(value, item("1"));
    assert_eq!(counters_a.snapshot(), (1, 0, 0));

    store_b.delete("c-remote").await.unwrap();
    settle().await;
    assert!(store_a.get("c-remote").is_none());
    assert_eq!(counters_a.snapshot(), (1, 0, 1));
}

#[tokio::test]
async fn sync_reconciles_only_the_local_shard_in_the_kv() {
    let (client_a, client_b) = common::shared_memory_clients("/t/containers");

    let store_a = ShardedStore::new(client_a, "host-a", ShardHandlers::new());
    store_a
        .clone()
        .init(HashMap::from([("c1".to_string(), item("1"))]))
        .await
        .unwrap();
    let store_b = ShardedStore::new(client_b, "host-b", ShardHandlers::new());
    store_b
        .clone()
        .init(HashMap::from([("c2".to_string(), item("1"))]))
        .await
        .unwrap();
    settle().await;

    // host-a drops c1 and gains c3; host-b's shard must be untouched.
    store_a
        .sync(HashMap::from([("c3".to_string(), item("1"))]))
        .await
        .unwrap();
    settle().await;

    assert!(store_a.get("c1").is_none());
    assert!(store_a.get("c3").is_some());
    let (shard, _) = store_a.get("c2").expect("remote item still visible");
    assert_eq!(shard, "host-b");
}
