//! Sharded Map Implementation
//!
//! Concurrent hashmap split into a power-of-two number of shards, each behind
//! its own RwLock, so readers of different keys never contend.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and statistics
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Run `f` against the value under the read lock.
    pub fn read<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.map.read();
        guard.get(key).map(f)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().remove(key)
    }

    /// Remove the value only if `pred` holds for it.
    pub fn remove_if<Q>(&self, key: &Q, pred: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.map.write();
        if guard.get(key).is_some_and(pred) {
            self.writes.fetch_add(1, Ordering::Relaxed);
            guard.remove(key)
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.map.write().clear();
    }

    /// Visit every entry under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let guard = self.map.read();
        for (k, v) in guard.iter() {
            f(k, v);
        }
    }
}

/// Sharded map with a compile-time shard count (power of two)
pub struct ShardedMap<K, V, const N: usize = 16> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<K, V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }
}

impl<K: Eq + Hash, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for<Q: Hash + ?Sized>(&self, key: &Q) -> &Shard<K, V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn read<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).read(key, f)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove(key)
    }

    pub fn remove_if<Q>(&self, key: &Q, pred: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove_if(key, pred)
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in self.shards.iter() {
            shard.for_each(&mut f);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_insert_read_remove() {
        let shard: Shard<String, i32> = Shard::new();
        assert!(shard.is_empty());

        assert!(shard.insert("key1".to_string(), 42).is_none());
        assert_eq!(shard.read("key1", |v| *v), Some(42));
        assert_eq!(shard.remove("key1"), Some(42));
        assert!(shard.is_empty());
        assert_eq!(shard.read_count(), 1);
        assert_eq!(shard.write_count(), 2);
    }

    #[test]
    fn test_remove_if() {
        let shard: Shard<String, i32> = Shard::new();
        shard.insert("k".to_string(), 1);
        assert!(shard.remove_if("k", |v| *v == 2).is_none());
        assert_eq!(shard.remove_if("k", |v| *v == 1), Some(1));
    }

    #[test]
    fn test_sharded_map_spreads_keys() {
        let map: ShardedMap<String, usize, 8> = ShardedMap::new();
        for i in 0..200 {
            map.insert(format!("key{}", i), i);
        }
        assert_eq!(map.len(), 200);
        assert_eq!(map.shard_count(), 8);
        assert!(map.shards.iter().filter(|s| !s.is_empty()).count() > 1);

        let mut sum = 0;
        map.for_each(|_, v| sum += v);
        assert_eq!(sum, (0..200).sum::<usize>());

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<String, usize>> = Arc::new(ShardedMap::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..250 {
                        map.insert(format!("t{}-{}", t, i), i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 1000);
    }
}
