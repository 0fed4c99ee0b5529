//! Unsharded distributed store.
//!
//! Values of one type live at `P/<item-id>`. A *writer* node seeds the KV
//! prefix from a local truth map on init and reconciles with `sync`; a
//! *reader* node loads the existing KV state. Both then follow the prefix
//! watch, which drives the add/change/remove callbacks.

use crate::core::error::{DriverError, Result};
use crate::kv::{KvClient, WatchEvent};
use crate::store::{Handlers, Item, ItemChange, StoreValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Role of this node for a given store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Owns the data: seeds and reconciles the KV prefix.
    Writer,
    /// Mirrors the data written by another node.
    Reader,
}

pub struct DistributedStore<T> {
    client: KvClient,
    role: StoreRole,
    handlers: Handlers<T>,
    data: Mutex<HashMap<String, T>>,
}

/// Diff of one reconcile cycle, in callback order.
struct Diff<T> {
    added: Vec<Item<T>>,
    changed: Vec<ItemChange<T>>,
    removed: Vec<Item<T>>,
}

impl<T: StoreValue> DistributedStore<T> {
    pub fn new(client: KvClient, role: StoreRole, handlers: Handlers<T>) -> Arc<Self> {
        Arc::new(Self {
            client,
            role,
            handlers,
            data: Mutex::new(HashMap::new()),
        })
    }

    /// Seed (writer) or load (reader) the store, then start following the
    /// prefix watch. Init itself never fires callbacks.
    pub async fn init(self: Arc<Self>, truth: Option<HashMap<String, T>>) -> Result<()> {
        match self.role {
            StoreRole::Writer => {
                self.reconcile(truth.unwrap_or_default(), false).await?;
            }
            StoreRole::Reader => {
                let loaded = self.load().await?;
                *self.data.lock() = loaded;
            }
        }

        let mut watch = self.client.watch().await?;
        let store = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                store.handle_watch_event(event);
            }
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.data.lock().get(id).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, T> {
        self.data.lock().clone()
    }

    /// Conditional put (skipped when the stored bytes already match)
    /// followed by the matching local callback.
    pub async fn add_or_update(&self, id: &str, value: T) -> Result<()> {
        let encoded = encode(&value)?;
        self.client.put_if_new_or_changed(&[id], encoded).await?;

        let previous = self.data.lock().insert(id.to_string(), value.clone());
        match previous {
            None => self.fire_added(&[Item {
                id: id.to_string(),
                value,
            }]),
            Some(previous) if previous != value => self.fire_changed(&[ItemChange {
                id: id.to_string(),
                previous,
                current: value,
            }]),
            Some(_) => {}
        }
        Ok(())
    }

    /// Unconditional delete; `on_removed` fires only if the item was known
    /// locally.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client.delete(&[id]).await?;
        if let Some(value) = self.data.lock().remove(id) {
            self.fire_removed(&[Item {
                id: id.to_string(),
                value,
            }]);
        }
        Ok(())
    }

    /// Reconcile the full truth: KV puts for new/changed items, KV deletes
    /// for items that vanished, then callbacks for the computed diff.
    pub async fn sync(&self, truth: HashMap<String, T>) -> Result<()> {
        self.reconcile(truth, true).await
    }

    async fn reconcile(&self, truth: HashMap<String, T>, fire: bool) -> Result<()> {
        let kv_state = self.load().await?;

        for (id, value) in &truth {
            self.client
                .put_if_new_or_changed(&[id.as_str()], encode(value)?)
                .await?;
        }
        for id in kv_state.keys() {
            if !truth.contains_key(id) {
                self.client.delete(&[id.as_str()]).await?;
            }
        }

        let diff = {
            let mut data = self.data.lock();
            let diff = diff_maps(&data, &truth);
            *data = truth;
            diff
        };

        if fire {
            self.fire_added(&diff.added);
            self.fire_changed(&diff.changed);
            self.fire_removed(&diff.removed);
        }
        Ok(())
    }

    async fn load(&self) -> Result<HashMap<String, T>> {
        let mut result = HashMap::new();
        for record in self.client.get_all().await? {
            let Some(parts) = self.client.relative(&record.key) else {
                continue;
            };
            let [id] = parts.as_slice() else {
                debug!(key = %record.key, "ignoring unexpected key under store prefix");
                continue;
            };
            match serde_json::from_slice(&record.value) {
                Ok(value) => {
                    result.insert(id.to_string(), value);
                }
                Err(err) => warn!(key = %record.key, error = %err, "undecodable store item"),
            }
        }
        Ok(result)
    }

    fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(record) => {
                let Some(parts) = self.client.relative(&record.key) else {
                    return;
                };
                let [id] = parts.as_slice() else {
                    debug!(key = %record.key, "ignoring unexpected key in watch event");
                    return;
                };
                let id = id.to_string();
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
                        // Already reflected locally (typically our own write
                        // echoed back); equality keeps this idempotent.
                        Some(existing) if *existing == value => return,
                        _ => data.insert(id.clone(), value.clone()),
                    }
                };
                match previous {
                    None => self.fire_added(&[Item { id, value }]),
                    Some(previous) => self.fire_changed(&[ItemChange {
                        id,
                        previous,
                        current: value,
                    }]),
                }
            }
            WatchEvent::Delete { key, .. } => {
                let Some(parts) = self.client.relative(&key) else {
                    return;
                };
                let [id] = parts.as_slice() else { return };
                let removed = self.data.lock().remove(*id);
                if let Some(value) = removed {
                    self.fire_removed(&[Item {
                        id: id.to_string(),
                        value,
                    }]);
                }
            }
        }
    }

    fn fire_added(&self, items: &[Item<T>]) {
        if items.is_empty() {
            return;
        }
        if let Some(handler) = &self.handlers.on_added {
            handler(items);
        }
    }

    fn fire_changed(&self, items: &[ItemChange<T>]) {
        if items.is_empty() {
            return;
        }
        if let Some(handler) = &self.handlers.on_changed {
            handler(items);
        }
    }

    fn fire_removed(&self, items: &[Item<T>]) {
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

fn diff_maps<T: StoreValue>(current: &HashMap<String, T>, truth: &HashMap<String, T>) -> Diff<T> {
    let mut diff = Diff {
        added: Vec::new(),
        changed: Vec::new(),
        removed: Vec::new(),
    };

    for (id, value) in truth {
        match current.get(id) {
            None => diff.added.push(Item {
                id: id.clone(),
                value: value.clone(),
            }),
            Some(previous) if previous != value => diff.changed.push(ItemChange {
                id: id.clone(),
                previous: previous.clone(),
                current: value.clone(),
            }),
            Some(_) => {}
        }
    }
    for (id, value) in current {
        if !truth.contains_key(id) {
            diff.removed.push(Item {
                id: id.clone(),
                value: value.clone(),
            });
        }
    }
    diff
}
