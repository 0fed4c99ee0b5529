//! Sharded distributed store.
//!
//! Partitions the keyspace as `P/<shard-key>/<item-id>`. Each host owns its
//! shard and is the only writer to it; reads and the in-memory view span all
//! shards. Item IDs must be unique across shards. Watch events originating
//! from the local shard are ignored: for locally-initiated changes the
//! in-memory state is already authoritative by the time the echo arrives.

use crate::core::error::{DriverError, Result};
use crate::kv::{KvClient, WatchEvent};
use crate::store::{ShardHandlers, ShardItem, ShardItemChange, StoreValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ShardedStore<T> {
    client: KvClient,
    local_shard: String,
    handlers: ShardHandlers<T>,
    data: Mutex<Sharded<T>>,
}

struct Sharded<T> {
    /// shard key -> item id -> value
    shards: HashMap<String, HashMap<String, T>>,
    /// item id -> owning shard key
    item_shard: HashMap<String, String>,
}

impl<T> Default for Sharded<T> {
    fn default() -> Self {
        Self {
            shards: HashMap::new(),
            item_shard: HashMap::new(),
        }
    }
}

impl<T: Clone> Sharded<T> {
    fn get(&self, id: &str) -> Option<(String, T)> {
        let shard = self.item_shard.get(id)?;
        let value = self.shards.get(shard)?.get(id)?;
        Some((shard.clone(), value.clone()))
    }

    fn insert(&mut self, shard: &str, id: &str, value: T) -> Option<T> {
        self.item_shard.insert(id.to_string(), shard.to_string());
        self.shards
            .entry(shard.to_string())
            .or_default()
            .insert(id.to_string(), value)
    }

    fn remove(&mut self, id: &str) -> Option<(String, T)> {
        let shard = self.item_shard.remove(id)?;
        let value = self.shards.get_mut(&shard)?.remove(id)?;
        Some((shard, value))
    }
}

impl<T: StoreValue> ShardedStore<T> {
    pub fn new(client: KvClient, local_shard: impl Into<String>, handlers: ShardHandlers<T>) -> Arc<Self> {
        Arc::new(Self {
            client,
            local_shard: local_shard.into(),
            handlers,
            data: Mutex::new(Sharded::default()),
        })
    }

    pub fn local_shard_key(&self) -> &str {
        &self.local_shard
    }

    /// Reconcile the local shard against `truth`, absorb all remote shards
    /// from the KV, then start following the prefix watch. Init itself never
    /// fires callbacks.
    pub async fn init(self: Arc<Self>, truth: HashMap<String, T>) -> Result<()> {
        self.reconcile(truth, false).await?;

        let mut watch = self.client.watch().await?;
        let store = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                store.handle_watch_event(event);
            }
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<(String, T)> {
        self.data.lock().get(id)
    }

    /// shard key -> item id -> value snapshot across all shards.
    pub fn get_all(&self) -> HashMap<String, HashMap<String, T>> {
        self.data.lock().shards.clone()
    }

    pub fn get_shard(&self, shard: &str) -> Option<HashMap<String, T>> {
        self.data.lock().shards.get(shard).cloned()
    }

    /// Write to the local shard and fire the matching callback.
    pub async fn add_or_update(&self, id: &str, value: T) -> Result<()> {
        let encoded = encode(&value)?;
        self.client
            .put_if_new_or_changed(&[self.local_shard.as_str(), id], encoded)
            .await?;

        let previous = self.data.lock().insert(&self.local_shard, id, value.clone());
        match previous {
            None => self.fire_added(&[ShardItem {
                shard: self.local_shard.clone(),
                id: id.to_string(),
                value,
            }]),
            Some(previous) if previous != value => self.fire_changed(&[ShardItemChange {
                shard: self.local_shard.clone(),
                id: id.to_string(),
                previous,
                current: value,
            }]),
            Some(_) => {}
        }
        Ok(())
    }

    /// Delete from the local shard; `on_removed` fires only if the item was
    /// known locally.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(&[self.local_shard.as_str(), id])
            .await?;
        let removed = self.data.lock().remove(id);
        if let Some((shard, value)) = removed {
            self.fire_removed(&[ShardItem {
                shard,
                id: id.to_string(),
                value,
            }]);
        }
        Ok(())
    }

    /// Full reconcile of the local shard plus absorption of remote shards.
    pub async fn sync(&self, truth: HashMap<String, T>) -> Result<()> {
        self.reconcile(truth, true).await
    }

    async fn reconcile(&self, truth: HashMap<String, T>, fire: bool) -> Result<()> {
        let kv_state = self.load().await?;

        // Local shard: KV follows the truth map.
        for (id, value) in &truth {
            self.client
                .put_if_new_or_changed(&[self.local_shard.as_str(), id.as_str()], encode(value)?)
                .await?;
        }
        if let Some(local_in_kv) = kv_state.get(&self.local_shard) {
            for id in local_in_kv.keys() {
                if !truth.contains_key(id) {
                    self.client
                        .delete(&[self.local_shard.as_str(), id.as_str()])
                        .await?;
                }
            }
        }

        let mut added = Vec::new();
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        {
            let mut data = self.data.lock();

            let mut next = Sharded::default();
            for (id, value) in &truth {
                next.insert(&self.local_shard, id, value.clone());
            }
            for (shard, items) in &kv_state {
                if shard == &self.local_shard {
                    continue;
                }
                for (id, value) in items {
                    next.insert(shard, id, value.clone());
                }
            }

            for (id, shard) in &next.item_shard {
                let value = next.shards[shard][id].clone();
                match data.get(id) {
                    None => added.push(ShardItem {
                        shard: shard.clone(),
                        id: id.clone(),
                        value,
                    }),
                    Some((_, previous)) if previous != value => changed.push(ShardItemChange {
                        shard: shard.clone(),
                        id: id.clone(),
                        previous,
                        current: value,
                    }),
                    Some(_) => {}
                }
            }
            for (id, shard) in data.item_shard.clone() {
                if !next.item_shard.contains_key(&id) {
                    let value = data.shards[&shard][&id].clone();
                    removed.push(ShardItem {
                        shard,
                        id,
                        value,
                    });
                }
            }

            *data = next;
        }

        if fire {
            self.fire_added(&added);
            self.fire_changed(&changed);
            self.fire_removed(&removed);
        }
        Ok(())
    }

    async fn load(&self) -> Result<HashMap<String, HashMap<String, T>>> {
        let mut result: HashMap<String, HashMap<String, T>> = HashMap::new();
        for record in self.client.get_all().await? {
            let Some(parts) = self.client.relative(&record.key) else {
                continue;
            };
            let [shard, id] = parts.as_slice() else {
                debug!(key = %record.key, "ignoring unexpected key under sharded prefix");
                continue;
            };
            match serde_json::from_slice(&record.value) {
                Ok(value) => {
                    result
                        .entry(shard.to_string())
                        .or_default()
                        .insert(id.to_string(), value);
                }
                Err(err) => warn!(key = %record.key, error = %err, "undecodable store item"),
            }
        }
        Ok(result)
    }

    fn handle_watch_event(&self, event: WatchEvent) {
        let Some(parts) = self.client.relative(event.key()) else {
            return;
        };
        let [shard, id] = parts.as_slice() else {
            debug!(key = %event.key(), "ignoring unexpected key in watch event");
            return;
        };
        if *shard == self.local_shard {
            return;
        }
        let (shard, id) = (shard.to_string(), id.to_string());

        match event {
            WatchEvent::Put(record) => {
                let value: T = match serde_json::from_slice(&record.value) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(key = %record.key, error = %err, "undecodable watch event");
                        return;
                    }
                };
                let previous = {
                    let mut data = self.data.lock();
                    match data.get(&id) {
                        Some((_, existing)) if existing == value => return,
                        _ => data.insert(&shard, &id, value.clone()),
                    }
                };
                match previous {
                    None => self.fire_added(&[ShardItem { shard, id, value }]),
                    Some(previous) => self.fire_changed(&[ShardItemChange {
                        shard,
                        id,
                        previous,
                        current: value,
                    }]),
                }
            }
            WatchEvent::Delete { .. } => {
                let removed = self.data.lock().remove(&id);
                if let Some((shard, value)) = removed {
                    self.fire_removed(&[ShardItem { shard, id, value }]);
                }
            }
        }
    }

    fn fire_added(&self, items: &[ShardItem<T>]) {
        if items.is_empty() {
            return;
        }
        if let Some(handler) = &self.handlers.on_added {
            handler(items);
        }
    }

    fn fire_changed(&self, items: &[ShardItemChange<T>]) {
        if items.is_empty() {
            return;
        }
        if let Some(handler) = &self.handlers.on_changed {
            handler(items);
        }
    }

    fn fire_removed(&self, items: &[ShardItem<T>]) {
        if items.is_empty() {
            return;
        }
        if let Some(handler) = &self.handlers.on_removed {
            handler(items);
        }
    }
}

fn encode<T: StoreValue>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| DriverError::CorruptValue {
        key: String::new(),
        message: format!("serialize: {err}"),
    })
}
