//! A single bounded cache partition.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::trace;

use super::entry::CacheEntry;
use super::metrics::{PartitionMetrics, PartitionSnapshot};
use super::shard::ShardedMap;
use crate::config::PartitionConfig;
use crate::domain::{CacheId, CacheValue};

/// Cache partition with item limit, TTL and groups.
pub struct CachePartition {
    id: CacheId,
    config: PartitionConfig,
    items: ShardedMap<String, CacheEntry>,
    /// group ID → item keys
    groups: RwLock<HashMap<String, HashSet<String>>>,
    metrics: PartitionMetrics,
}

impl CachePartition {
    pub fn new(id: CacheId, config: PartitionConfig) -> Self {
        Self {
            id,
            config,
            items: ShardedMap::new(),
            groups: RwLock::new(HashMap::new()),
            metrics: PartitionMetrics::new(),
        }
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up a key, dropping it if its TTL ran out.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let ttl = self.config.ttl();
        let static_ttl = self.config.static_ttl;
        let found = self.items.read(key, |entry| {
            if entry.metadata.is_expired(ttl, static_ttl) {
                None
            } else {
                entry.metadata.touch();
                Some(entry.value.clone())
            }
        });
        match found {
            Some(Some(value)) => {
                self.metrics.record_hit();
                Some(value)
            }
            Some(None) => {
                self.expire(key);
                self.metrics.record_miss();
                None
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    pub fn has_item(&self, key: &str) -> bool {
        let ttl = self.config.ttl();
        let static_ttl = self.config.static_ttl;
        self.items
            .read(key, |entry| !entry.metadata.is_expired(ttl, static_ttl))
            .unwrap_or(false)
    }

    /// Store a value; a disabled partition ignores the write.
    pub fn set(&self, key: &str, value: CacheValue, groups: &[String]) {
        if self.config.is_disabled() {
            return;
        }
        let old = self
            .items
            .insert(key.to_string(), CacheEntry::new(value, groups.to_vec()));
        {
            let mut index = self.groups.write();
            if let Some(old) = &old {
                for group in old.groups.iter().filter(|g| !groups.contains(*g)) {
                    Self::unlink(&mut index, group, key);
                }
            }
            for group in groups {
                index
                    .entry(group.clone())
                    .or_default()
                    .insert(key.to_string());
            }
        }
        if old.is_none() {
            self.enforce_limit(key);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.items.remove(key) {
            Some(entry) => {
                let mut index = self.groups.write();
                for group in &entry.groups {
                    Self::unlink(&mut index, group, key);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every item of a group.
    pub fn remove_group(&self, group: &str) -> usize {
        let keys = self.groups.write().remove(group).unwrap_or_default();
        let mut removed = 0;
        for key in &keys {
            if self.remove(key) {
                removed += 1;
            }
        }
        removed
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }

    pub fn group_item_ids(&self, group: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .groups
            .read()
            .get(group)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.items.clear();
        self.groups.write().clear();
    }

    /// Keys starting with `prefix`, sorted.
    pub fn item_ids(&self, prefix: &str) -> Vec<String> {
        let mut keys = Vec::new();
        self.items.for_each(|k, _| {
            if k.starts_with(prefix) {
                keys.push(k.clone());
            }
        });
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> PartitionSnapshot {
        self.metrics.snapshot(self.len())
    }

    pub fn metrics(&self) -> &PartitionMetrics {
        &self.metrics
    }

    fn expire(&self, key: &str) {
        let ttl = self.config.ttl();
        let static_ttl = self.config.static_ttl;
        if let Some(entry) = self
            .items
            .remove_if(key, |e| e.metadata.is_expired(ttl, static_ttl))
        {
            let mut index = self.groups.write();
            for group in &entry.groups {
                Self::unlink(&mut index, group, key);
            }
            self.metrics.record_expiration();
        }
    }

    /// Evict least recently used entries until the partition fits its limit.
    /// `keep` is the key that triggered the eviction and is never chosen.
    fn enforce_limit(&self, keep: &str) {
        let Some(max) = self.config.max_items() else {
            return;
        };
        let len = self.items.len();
        if len <= max {
            return;
        }
        let excess = len - max;

        let mut candidates: Vec<(u64, String)> = Vec::with_capacity(len);
        self.items.for_each(|k, entry| {
            if k != keep {
                candidates.push((entry.metadata.last_access(), k.clone()));
            }
        });
        candidates.sort();

        let mut evicted = 0u64;
        for (_, key) in candidates.into_iter().take(excess) {
            if self.remove(&key) {
                evicted += 1;
            }
        }
        trace!(partition = %self.id, evicted, "evicted cache entries");
        self.metrics.record_evictions(evicted);
    }

    fn unlink(index: &mut HashMap<String, HashSet<String>>, group: &str, key: &str) {
        if let Some(keys) = index.get_mut(group) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn index(ids: &[&str]) -> CacheValue {
        CacheValue::Index(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_set_get_remove() {
        let p = CachePartition::new(CacheId::Filters, PartitionConfig::default());
        p.set("cgrates.org:F1", CacheValue::Absent, &[]);
        assert_eq!(p.get("cgrates.org:F1"), Some(CacheValue::Absent));
        assert!(p.remove("cgrates.org:F1"));
        assert_eq!(p.get("cgrates.org:F1"), None);
        assert_eq!(p.metrics().hits(), 1);
        assert_eq!(p.metrics().misses(), 1);
    }

    #[test]
    fn test_disabled_partition_stores_nothing() {
        let cfg = PartitionConfig {
            limit: 0,
            ..Default::default()
        };
        let p = CachePartition::new(CacheId::Resources, cfg);
        p.set("k", CacheValue::Absent, &[]);
        assert!(p.is_empty());
    }

    #[test]
    fn test_limit_evicts_least_recently_used() {
        let cfg = PartitionConfig {
            limit: 2,
            ..Default::default()
        };
        let p = CachePartition::new(CacheId::Filters, cfg);
        p.set("a", CacheValue::Absent, &[]);
        sleep(Duration::from_millis(2));
        p.set("b", CacheValue::Absent, &[]);
        sleep(Duration::from_millis(2));
        assert!(p.get("a").is_some());
        sleep(Duration::from_millis(2));
        p.set("c", CacheValue::Absent, &[]);

        assert_eq!(p.len(), 2);
        assert!(p.has_item("a"));
        assert!(!p.has_item("b"));
        assert!(p.has_item("c"));
        assert_eq!(p.snapshot().evictions, 1);
    }

    #[test]
    fn test_sliding_ttl_expires_idle_entries() {
        let cfg = PartitionConfig {
            ttl: Duration::from_millis(30),
            ..Default::default()
        };
        let p = CachePartition::new(CacheId::Filters, cfg);
        p.set("k", CacheValue::Absent, &[]);
        sleep(Duration::from_millis(50));
        assert_eq!(p.get("k"), None);
        assert!(p.is_empty());
        assert_eq!(p.snapshot().expirations, 1);
    }

    #[test]
    fn test_groups() {
        let p = CachePartition::new(CacheId::ResourceFilterIndexes, PartitionConfig::default());
        let grp = vec!["cgrates.org".to_string()];
        p.set("cgrates.org:*string:*req.Account:1001", index(&["RP1"]), &grp);
        p.set("cgrates.org:*string:*req.Account:1002", index(&["RP2"]), &grp);
        p.set("other.org:*string:*req.Account:1001", index(&["RP3"]), &[]);

        assert!(p.has_group("cgrates.org"));
        assert_eq!(p.group_item_ids("cgrates.org").len(), 2);
        assert_eq!(p.remove_group("cgrates.org"), 2);
        assert!(!p.has_group("cgrates.org"));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_reset_groups_on_overwrite() {
        let p = CachePartition::new(CacheId::Filters, PartitionConfig::default());
        p.set("k", CacheValue::Absent, &["g1".to_string()]);
        p.set("k", CacheValue::Absent, &["g2".to_string()]);
        assert!(!p.has_group("g1"));
        assert_eq!(p.group_item_ids("g2"), vec!["k".to_string()]);
    }

    #[test]
    fn test_item_ids_prefix() {
        let p = CachePartition::new(CacheId::Filters, PartitionConfig::default());
        p.set("cgrates.org:F2", CacheValue::Absent, &[]);
        p.set("cgrates.org:F1", CacheValue::Absent, &[]);
        p.set("other.org:F1", CacheValue::Absent, &[]);
        assert_eq!(
            p.item_ids("cgrates.org:"),
            vec!["cgrates.org:F1".to_string(), "cgrates.org:F2".to_string()]
        );
    }
}
