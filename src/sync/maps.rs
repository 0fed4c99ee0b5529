//! Concurrent map primitives.
//!
//! Plain lock-guarded maps with snapshot accessors. Holders must not call
//! back into the map from inside closures passed to it; every method
//! releases the lock before returning.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

/// A `HashMap` behind an `RwLock` with clone-out accessors.
pub struct ConcurrentMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write().insert(key, value)
    }

    /// Fetch or create. Returns the value and whether it was newly inserted.
    pub fn get_or_insert_with(&self, key: K, create: impl FnOnce() -> V) -> (V, bool) {
        let mut inner = self.inner.write();
        match inner.get(&key) {
            Some(value) => (value.clone(), false),
            None => {
                let value = create();
                inner.insert(key, value.clone());
                (value, true)
            }
        }
    }

    /// Remove and return the value if present.
    pub fn try_remove(&self, key: &K) -> Option<V> {
        self.inner.write().remove(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// A map addressable by either of two keys.
///
/// Networks are looked up by flannel ID (IPAM path) and by runtime network
/// ID (network-driver path); both indices are kept consistent under one
/// lock.
pub struct DualKeyMap<A, B, V> {
    inner: RwLock<DualInner<A, B, V>>,
}

struct DualInner<A, B, V> {
    by_primary: HashMap<A, V>,
    secondary_to_primary: HashMap<B, A>,
    primary_to_secondary: HashMap<A, B>,
}

impl<A, B, V> Default for DualKeyMap<A, B, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(DualInner {
                by_primary: HashMap::new(),
                secondary_to_primary: HashMap::new(),
                primary_to_secondary: HashMap::new(),
            }),
        }
    }
}

impl<A, B, V> DualKeyMap<A, B, V>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the primary key; the secondary key may not be known
    /// yet and can be attached by a later insert.
    pub fn insert(&self, primary: A, secondary: Option<B>, value: V) {
        let mut inner = self.inner.write();
        if let Some(secondary) = secondary {
            inner
                .secondary_to_primary
                .insert(secondary.clone(), primary.clone());
            inner.primary_to_secondary.insert(primary.clone(), secondary);
        }
        inner.by_primary.insert(primary, value);
    }

    pub fn get_by_primary(&self, primary: &A) -> Option<V> {
        self.inner.read().by_primary.get(primary).cloned()
    }

    pub fn get_by_secondary(&self, secondary: &B) -> Option<V> {
        let inner = self.inner.read();
        let primary = inner.secondary_to_primary.get(secondary)?;
        inner.by_primary.get(primary).cloned()
    }

    pub fn remove_by_primary(&self, primary: &A) -> Option<V> {
        let mut inner = self.inner.write();
        if let Some(secondary) = inner.primary_to_secondary.remove(primary) {
            inner.secondary_to_primary.remove(&secondary);
        }
        inner.by_primary.remove(primary)
    }

    pub fn primary_keys(&self) -> Vec<A> {
        self.inner.read().by_primary.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().by_primary.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_primary.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_insert_with_creates_once() {
        let map: ConcurrentMap<String, u32> = ConcurrentMap::new();
        let (value, created) = map.get_or_insert_with("a".into(), || 1);
        assert!(created);
        assert_eq!(value, 1);
        let (value, created) = map.get_or_insert_with("a".into(), || 2);
        assert!(!created);
        assert_eq!(value, 1);
    }

    #[test]
    fn dual_key_lookup_and_removal() {
        let map: DualKeyMap<String, String, u32> = DualKeyMap::new();
        map.insert("flannel-1".into(), Some("docker-1".into()), 7);

        assert_eq!(map.get_by_primary(&"flannel-1".into()), Some(7));
        assert_eq!(map.get_by_secondary(&"docker-1".into()), Some(7));

        assert_eq!(map.remove_by_primary(&"flannel-1".into()), Some(7));
        assert_eq!(map.get_by_secondary(&"docker-1".into()), None);
        assert!(map.is_empty());
    }

    #[test]
    fn secondary_key_can_arrive_late() {
        let map: DualKeyMap<String, String, u32> = DualKeyMap::new();
        map.insert("flannel-1".into(), None, 7);
        assert_eq!(map.get_by_primary(&"flannel-1".into()), Some(7));
        assert_eq!(map.get_by_secondary(&"docker-1".into()), None);

        map.insert("flannel-1".into(), Some("docker-1".into()), 7);
        assert_eq!(map.get_by_secondary(&"docker-1".into()), Some(7));
        assert_eq!(map.len(), 1);
    }
}
