//! In-memory store driver.
//!
//! Backs the `*internal` data DB and every test. Items live under
//! `<prefix><tenant>:<id>`, index keys under `(partition, tenant context)`,
//! matching the key layout the precache path expects from
//! `get_keys_for_prefix`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::domain::{concatenated_key, CacheId, DataDriver, Entity, Indexes, NON_TRANSACTIONAL};
use crate::error::{Error, Result};

type IndexSlot = (CacheId, String);

/// DashMap-backed [`DataDriver`].
#[derive(Debug, Default)]
pub struct InternalDb {
    items: DashMap<String, Entity>,
    indexes: DashMap<IndexSlot, Indexes>,
    /// Index writes staged per transaction until committed
    staged: DashMap<String, BTreeMap<IndexSlot, Indexes>>,
    load_ids: RwLock<BTreeMap<CacheId, i64>>,
    reads: AtomicU64,
}

impl InternalDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Item and index reads served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    fn item_key(cache_id: CacheId, tenant: &str, id: &str) -> String {
        format!("{}{}", cache_id.prefix(), concatenated_key(&[tenant, id]))
    }

    fn apply_indexes(&self, slot: IndexSlot, indexes: &Indexes) {
        let mut entry = self.indexes.entry(slot.clone()).or_default();
        for (key, ids) in indexes {
            if ids.is_empty() {
                entry.remove(key);
            } else {
                entry.insert(key.clone(), ids.clone());
            }
        }
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.indexes.remove(&slot);
        }
    }
}

#[async_trait]
impl DataDriver for InternalDb {
    async fn get_item_drv(&self, cache_id: CacheId, tenant: &str, id: &str) -> Result<Entity> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.items
            .get(&Self::item_key(cache_id, tenant, id))
            .map(|e| e.value().clone())
            .ok_or(Error::NotFound)
    }

    async fn set_item_drv(&self, item: &Entity) -> Result<()> {
        let key = Self::item_key(item.cache_id(), item.tenant(), item.id());
        trace!(key = %key, "storing item");
        self.items.insert(key, item.clone());
        Ok(())
    }

    async fn remove_item_drv(&self, cache_id: CacheId, tenant: &str, id: &str) -> Result<()> {
        self.items
            .remove(&Self::item_key(cache_id, tenant, id))
            .map(drop)
            .ok_or(Error::NotFound)
    }

    async fn has_item_drv(&self, cache_id: CacheId, tenant: &str, id: &str) -> Result<bool> {
        Ok(self.items.contains_key(&Self::item_key(cache_id, tenant, id)))
    }

    async fn get_keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .items
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        for slot in self.indexes.iter() {
            let (cache_id, tnt_ctx) = slot.key();
            for idx_key in slot.value().keys() {
                let full = format!(
                    "{}{}",
                    cache_id.prefix(),
                    concatenated_key(&[tnt_ctx.as_str(), idx_key.as_str()])
                );
                if full.starts_with(prefix) {
                    keys.push(full);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_indexes_drv(&self, idx: CacheId, tnt_ctx: &str, idx_key: &str) -> Result<Indexes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let slot = self
            .indexes
            .get(&(idx, tnt_ctx.to_string()))
            .ok_or(Error::NotFound)?;
        if idx_key.is_empty() {
            return Ok(slot.value().clone());
        }
        slot.get(idx_key)
            .map(|ids| Indexes::from([(idx_key.to_string(), ids.clone())]))
            .ok_or(Error::NotFound)
    }

    async fn set_indexes_drv(
        &self,
        idx: CacheId,
        tnt_ctx: &str,
        indexes: &Indexes,
        commit: bool,
        txn_id: &str,
    ) -> Result<()> {
        let slot = (idx, tnt_ctx.to_string());
        if txn_id == NON_TRANSACTIONAL {
            self.apply_indexes(slot, indexes);
            return Ok(());
        }
        if !commit {
            let mut staged = self.staged.entry(txn_id.to_string()).or_default();
            let pending = staged.entry(slot).or_default();
            for (key, ids) in indexes {
                pending.insert(key.clone(), ids.clone());
            }
            return Ok(());
        }
        if let Some((_, staged)) = self.staged.remove(txn_id) {
            trace!(txn_id, slots = staged.len(), "committing staged indexes");
            for (slot, pending) in staged {
                self.apply_indexes(slot, &pending);
            }
        }
        self.apply_indexes(slot, indexes);
        Ok(())
    }

    async fn remove_indexes_drv(&self, idx: CacheId, tnt_ctx: &str, idx_key: &str) -> Result<()> {
        let slot = (idx, tnt_ctx.to_string());
        if idx_key.is_empty() {
            self.indexes.remove(&slot);
            return Ok(());
        }
        let empty = match self.indexes.get_mut(&slot) {
            Some(mut entry) => {
                entry.remove(idx_key);
                entry.is_empty()
            }
            None => false,
        };
        if empty {
            self.indexes.remove(&slot);
        }
        Ok(())
    }

    async fn get_load_ids_drv(&self, cache_ids: &[CacheId]) -> Result<BTreeMap<CacheId, i64>> {
        let all = self.load_ids.read();
        let found: BTreeMap<CacheId, i64> = if cache_ids.is_empty() {
            all.clone()
        } else {
            cache_ids
                .iter()
                .filter_map(|id| all.get(id).map(|v| (*id, *v)))
                .collect()
        };
        if found.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(found)
    }

    async fn set_load_ids_drv(&self, load_ids: &BTreeMap<CacheId, i64>) -> Result<()> {
        self.load_ids.write().extend(load_ids.iter().map(|(k, v)| (*k, *v)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Destination;
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;

    fn dst(id: &str) -> Entity {
        Entity::Destination(Destination {
            tenant: "cgrates.org".into(),
            id: id.into(),
            prefixes: vec!["+49".into()],
        })
    }

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_item_lifecycle() {
        let db = InternalDb::new();
        db.set_item_drv(&dst("DST_1")).await.unwrap();
        assert!(db.has_item_drv(CacheId::Destinations, "cgrates.org", "DST_1").await.unwrap());
        assert_eq!(
            db.get_item_drv(CacheId::Destinations, "cgrates.org", "DST_1").await.unwrap(),
            dst("DST_1")
        );
        db.remove_item_drv(CacheId::Destinations, "cgrates.org", "DST_1").await.unwrap();
        assert_matches!(
            db.remove_item_drv(CacheId::Destinations, "cgrates.org", "DST_1").await,
            Err(Error::NotFound)
        );
        assert_eq!(db.read_count(), 1);
    }

    #[tokio::test]
    async fn test_keys_for_prefix_cover_items_and_indexes() {
        let db = InternalDb::new();
        db.set_item_drv(&dst("DST_1")).await.unwrap();
        db.set_indexes_drv(
            CacheId::ReverseFilterIndexes,
            "cgrates.org:FLTR_1",
            &Indexes::from([("*route_filter_indexes".to_string(), ids(&["RP_1"]))]),
            true,
            NON_TRANSACTIONAL,
        )
        .await
        .unwrap();

        assert_eq!(
            db.get_keys_for_prefix("dst_").await.unwrap(),
            vec!["dst_cgrates.org:DST_1"]
        );
        assert_eq!(
            db.get_keys_for_prefix("fii_").await.unwrap(),
            vec!["fii_cgrates.org:FLTR_1:*route_filter_indexes"]
        );
    }

    #[tokio::test]
    async fn test_remove_missing_index_is_ok() {
        let db = InternalDb::new();
        db.remove_indexes_drv(CacheId::RouteFilterIndexes, "cgrates.org", "*string:a:b")
            .await
            .unwrap();
        db.remove_indexes_drv(CacheId::RouteFilterIndexes, "cgrates.org", "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_ids() {
        let db = InternalDb::new();
        assert_matches!(db.get_load_ids_drv(&[]).await, Err(Error::NotFound));
        db.set_load_ids_drv(&BTreeMap::from([(CacheId::Filters, 10)])).await.unwrap();
        db.set_load_ids_drv(&BTreeMap::from([(CacheId::Accounts, 20)])).await.unwrap();
        assert_eq!(db.get_load_ids_drv(&[]).await.unwrap().len(), 2);
        assert_eq!(
            db.get_load_ids_drv(&[CacheId::Filters]).await.unwrap(),
            BTreeMap::from([(CacheId::Filters, 10)])
        );
        assert_matches!(
            db.get_load_ids_drv(&[CacheId::Resources]).await,
            Err(Error::NotFound)
        );
    }
}
