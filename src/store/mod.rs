//! Distributed stores.
//!
//! Two-way synchronization between an in-memory index and a KV prefix, in
//! two flavors: [`unsharded::DistributedStore`] (one flat keyspace, any node
//! may write under optimistic concurrency) and [`sharded::ShardedStore`]
//! (per-host shards, the owner writes, everyone reads).
//!
//! Change callbacks fire synchronously from the mutating call or the watch
//! task, always outside the store lock and always in added → changed →
//! removed order within one cycle. The writer path mutates the in-memory
//! index only after the KV write succeeded, so a transport error leaves the
//! local view untouched.

pub mod sharded;
pub mod unsharded;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bound every stored value type must satisfy: byte-equality via
/// `PartialEq` drives callback suppression, serde drives the KV encoding.
pub trait StoreValue:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StoreValue for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// An item as seen by add/remove callbacks.
#[derive(Debug, Clone)]
pub struct Item<T> {
    pub id: String,
    pub value: T,
}

/// A changed item with both sides of the change.
#[derive(Debug, Clone)]
pub struct ItemChange<T> {
    pub id: String,
    pub previous: T,
    pub current: T,
}

/// An item tagged with its owning shard.
#[derive(Debug, Clone)]
pub struct ShardItem<T> {
    pub shard: String,
    pub id: String,
    pub value: T,
}

/// A changed item tagged with its owning shard.
#[derive(Debug, Clone)]
pub struct ShardItemChange<T> {
    pub shard: String,
    pub id: String,
    pub previous: T,
    pub current: T,
}

type Callback<E> = Box<dyn Fn(&[E]) + Send + Sync>;

/// Callbacks for an unsharded store. All optional.
#[derive(Default)]
pub struct Handlers<T> {
    pub(crate) on_added: Option<Callback<Item<T>>>,
    pub(crate) on_changed: Option<Callback<ItemChange<T>>>,
    pub(crate) on_removed: Option<Callback<Item<T>>>,
}

impl<T> Handlers<T> {
    pub fn new() -> Self {
        Self {
            on_added: None,
            on_changed: None,
            on_removed: None,
        }
    }

    pub fn on_added(mut self, handler: impl Fn(&[Item<T>]) + Send + Sync + 'static) -> Self {
        self.on_added = Some(Box::new(handler));
        self
    }

    pub fn on_changed(
        mut self,
        handler: impl Fn(&[ItemChange<T>]) + Send + Sync + 'static,
    ) -> Self {
        self.on_changed = Some(Box::new(handler));
        self
    }

    pub fn on_removed(mut self, handler: impl Fn(&[Item<T>]) + Send + Sync + 'static) -> Self {
        self.on_removed = Some(Box::new(handler));
        self
    }
}

/// Callbacks for a sharded store. All optional.
#[derive(Default)]
pub struct ShardHandlers<T> {
    pub(crate) on_added: Option<Callback<ShardItem<T>>>,
    pub(crate) on_changed: Option<Callback<ShardItemChange<T>>>,
    pub(crate) on_removed: Option<Callback<ShardItem<T>>>,
}

impl<T> ShardHandlers<T> {
    pub fn new() -> Self {
        Self {
            on_added: None,
            on_changed: None,
            on_removed: None,
        }
    }

    pub fn on_added(mut self, handler: impl Fn(&[ShardItem<T>]) + Send + Sync + 'static) -> Self {
        self.on_added = Some(Box::new(handler));
        self
    }

    pub fn on_changed(
        mut self,
        handler: impl Fn(&[ShardItemChange<T>]) + Send + Sync + 'static,
    ) -> Self {
        self.on_changed = Some(Box::new(handler));
        self
    }

    pub fn on_removed(
        mut self,
        handler: impl Fn(&[ShardItem<T>]) + Send + Sync + 'static,
    ) -> Self {
        self.on_removed = Some(Box::new(handler));
        self
    }
}
