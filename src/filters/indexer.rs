//! Forward and reverse filter index maintenance.
//!
//! Forward indexes live in the per-kind index partitions: tenant context is
//! the tenant, keys are [`IndexKey`]s, values are entity IDs. The reverse
//! index lives in `*reverse_filter_indexes`: tenant context is
//! `<tenant>:<filter ID>`, keys are index partition names, values are the
//! IDs of entities in that partition referencing the filter.
//!
//! Every read-modify-write of a tenant context runs under a guardian lock
//! named after the partition and context, so concurrent writers never lose
//! each other's updates.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use super::index_keys::{catch_all_key, compute_index_keys_with, IndexKey, RuleIndexer};
use crate::datamanager::DataManager;
use crate::domain::{concatenated_key, CacheId, Context, Filter, Indexes, NON_TRANSACTIONAL};
use crate::error::{Error, Result};
use crate::guardian::lock_key;

const INDEX_LOCK_TAG: &str = "idx:";

/// Index maintenance bound to a [`DataManager`].
pub struct FilterIndexer<'a> {
    dm: &'a DataManager,
}

impl<'a> FilterIndexer<'a> {
    pub fn new(dm: &'a DataManager) -> Self {
        Self { dm }
    }

    /// Index keys of a filter under the manager's rule indexers.
    pub fn compute(&self, filter: &Filter) -> Vec<IndexKey> {
        let indexers: Vec<&dyn RuleIndexer> =
            self.dm.rule_indexers().iter().map(|ix| ix.as_ref()).collect();
        compute_index_keys_with(filter, &indexers)
    }

    /// Keys an entity with `filter_ids` is indexed under.
    ///
    /// With `strict` a missing filter is a broken reference; otherwise it
    /// contributes nothing. `overridden` substitutes one filter's definition,
    /// `None` meaning the filter is gone. No keys at all means the catch-all.
    async fn keys_for_filters(
        &self,
        ctx: &Context,
        tenant: &str,
        filter_ids: &[String],
        overridden: Option<(&str, Option<&Filter>)>,
        strict: bool,
    ) -> Result<BTreeSet<IndexKey>> {
        let mut keys = BTreeSet::new();
        for fid in filter_ids {
            let filter = match overridden {
                Some((id, replacement)) if id == fid.as_str() => replacement.cloned(),
                _ => match self
                    .dm
                    .get_filter(ctx, tenant, fid, true, true, NON_TRANSACTIONAL)
                    .await
                {
                    Ok(f) => Some(f),
                    Err(Error::NotFound) if strict => {
                        return Err(Error::BrokenReference(fid.clone()))
                    }
                    Err(Error::NotFound) => None,
                    Err(e) => return Err(e),
                },
            };
            if let Some(filter) = filter {
                keys.extend(self.compute(&filter));
            }
        }
        if keys.is_empty() {
            keys.insert(catch_all_key());
        }
        Ok(keys)
    }

    /// Index keys for an entity, catch-all when it has no indexable filters.
    pub async fn entity_index_keys(
        &self,
        ctx: &Context,
        tenant: &str,
        filter_ids: &[String],
    ) -> Result<BTreeSet<IndexKey>> {
        self.keys_for_filters(ctx, tenant, filter_ids, None, true)
            .await
    }

    /// Move an entity from its `old` filter set to its `new` one.
    ///
    /// `None` stands for an entity that does not exist (before creation or
    /// after removal). Only the difference is written: keys in both sets are
    /// left alone, keys only in the old set lose the ID, keys only in the new
    /// set gain it. Reverse index entries follow the stored filter IDs.
    #[instrument(skip(self, ctx, old, new), fields(partition = %idx))]
    pub async fn index_entity(
        &self,
        ctx: &Context,
        idx: CacheId,
        tenant: &str,
        entity_id: &str,
        old: Option<&[String]>,
        new: Option<&[String]>,
    ) -> Result<()> {
        let old_keys = match old {
            Some(ids) => self.keys_for_filters(ctx, tenant, ids, None, false).await?,
            None => BTreeSet::new(),
        };
        let new_keys = match new {
            Some(ids) => self.keys_for_filters(ctx, tenant, ids, None, true).await?,
            None => BTreeSet::new(),
        };
        self.update_indexes(ctx, idx, tenant, entity_id, &new_keys, &old_keys)
            .await?;

        let old_refs = stored_filters(old.unwrap_or_default());
        let new_refs = stored_filters(new.unwrap_or_default());
        for fid in new_refs.difference(&old_refs) {
            self.update_reverse(ctx, tenant, fid, idx, entity_id, true)
                .await?;
        }
        for fid in old_refs.difference(&new_refs) {
            self.update_reverse(ctx, tenant, fid, idx, entity_id, false)
                .await?;
        }
        Ok(())
    }

    /// Add `entity_id` under the keys of `add` missing from `remove`, and
    /// drop it from the keys of `remove` missing from `add`.
    pub async fn update_indexes(
        &self,
        ctx: &Context,
        idx: CacheId,
        tenant: &str,
        entity_id: &str,
        add: &BTreeSet<IndexKey>,
        remove: &BTreeSet<IndexKey>,
    ) -> Result<()> {
        let added: Vec<String> = add.difference(remove).map(IndexKey::to_string).collect();
        let removed: Vec<String> = remove.difference(add).map(IndexKey::to_string).collect();
        self.apply(ctx, idx, tenant, entity_id, &added, &removed)
            .await
    }

    async fn update_reverse(
        &self,
        ctx: &Context,
        tenant: &str,
        filter_id: &str,
        idx: CacheId,
        entity_id: &str,
        add: bool,
    ) -> Result<()> {
        let tnt_ctx = concatenated_key(&[tenant, filter_id]);
        let key = vec![idx.as_str().to_string()];
        let (added, removed) = if add { (key, Vec::new()) } else { (Vec::new(), key) };
        self.apply(
            ctx,
            CacheId::ReverseFilterIndexes,
            &tnt_ctx,
            entity_id,
            &added,
            &removed,
        )
        .await
    }

    /// Guarded read-modify-write of index keys under one tenant context.
    async fn apply(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        entity_id: &str,
        added: &[String],
        removed: &[String],
    ) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let lock = lock_key(INDEX_LOCK_TAG, &concatenated_key(&[idx.as_str(), tnt_ctx]));
        self.dm
            .guardian()
            .guard(&[lock], None, || async {
                let mut changed = Indexes::new();
                for (key, insert) in added
                    .iter()
                    .map(|k| (k, true))
                    .chain(removed.iter().map(|k| (k, false)))
                {
                    let mut ids = match self.dm.driver().get_indexes_drv(idx, tnt_ctx, key).await {
                        Ok(mut current) => current.remove(key).unwrap_or_default(),
                        Err(Error::NotFound) => BTreeSet::new(),
                        Err(e) => return Err(e),
                    };
                    if insert {
                        ids.insert(entity_id.to_string());
                    } else {
                        ids.remove(entity_id);
                    }
                    changed.insert(key.clone(), ids);
                }
                debug!(partition = %idx, tnt_ctx, entity_id, keys = changed.len(), "updating index keys");
                self.dm
                    .set_indexes(ctx, idx, tnt_ctx, &changed, true, NON_TRANSACTIONAL)
                    .await
            })
            .await
    }

    // =========================================================================
    // Reverse index
    // =========================================================================

    /// Index partition name → IDs of entities referencing the filter.
    pub async fn filter_dependents(&self, ctx: &Context, tenant: &str, filter_id: &str) -> Result<Indexes> {
        match self
            .dm
            .get_indexes(
                ctx,
                CacheId::ReverseFilterIndexes,
                &concatenated_key(&[tenant, filter_id]),
                "",
                false,
                false,
            )
            .await
        {
            Ok(deps) => Ok(deps.into_iter().filter(|(_, ids)| !ids.is_empty()).collect()),
            Err(Error::NotFound) => Ok(Indexes::new()),
            Err(e) => Err(e),
        }
    }

    /// Index partitions holding entities that reference the filter, each
    /// with the index keys the filter contributes.
    pub async fn reverse_index_for_filter(
        &self,
        ctx: &Context,
        tenant: &str,
        filter_id: &str,
    ) -> Result<BTreeMap<CacheId, Vec<IndexKey>>> {
        let deps = self.filter_dependents(ctx, tenant, filter_id).await?;
        if deps.is_empty() {
            return Ok(BTreeMap::new());
        }
        let filter = self
            .dm
            .get_filter(ctx, tenant, filter_id, true, true, NON_TRANSACTIONAL)
            .await?;
        let mut keys = self.compute(&filter);
        if keys.is_empty() {
            keys.push(catch_all_key());
        }
        deps.keys()
            .map(|name| Ok((name.parse::<CacheId>()?, keys.clone())))
            .collect()
    }

    /// Re-index every entity referencing a filter that changed from `old`
    /// to `new`. Removal (`new` is `None`) also drops the filter's reverse
    /// index context.
    #[instrument(skip_all)]
    pub async fn update_filter_dependents(
        &self,
        ctx: &Context,
        old: Option<&Filter>,
        new: Option<&Filter>,
    ) -> Result<()> {
        let Some(subject) = old.or(new) else {
            return Ok(());
        };
        let (tenant, fid) = (subject.tenant.as_str(), subject.id.as_str());
        let deps = self.filter_dependents(ctx, tenant, fid).await?;

        for (partition, ids) in &deps {
            let idx: CacheId = partition.parse()?;
            let Some(owner) = idx.index_owner() else {
                continue;
            };
            for item_id in ids {
                let entity = match self
                    .dm
                    .get_entity(ctx, owner, tenant, item_id, true, false, NON_TRANSACTIONAL)
                    .await
                {
                    Ok(e) => e,
                    Err(Error::NotFound) => {
                        debug!(partition = %owner, item_id, "stale reverse index entry");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let before = self
                    .keys_for_filters(ctx, tenant, entity.filter_ids(), Some((fid, old)), false)
                    .await?;
                let after = self
                    .keys_for_filters(ctx, tenant, entity.filter_ids(), Some((fid, new)), false)
                    .await?;
                self.update_indexes(ctx, idx, tenant, item_id, &after, &before)
                    .await?;
            }
        }

        if new.is_none() {
            self.dm
                .remove_indexes(
                    ctx,
                    CacheId::ReverseFilterIndexes,
                    &concatenated_key(&[tenant, fid]),
                    "",
                )
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Bulk
    // =========================================================================

    /// Rebuild forward and reverse index entries for entities of `cache_id`
    /// (all of the tenant's when `ids` is `None`). Returns the touched index
    /// keys, tenant-qualified, per index partition.
    pub async fn compute_indexes(
        &self,
        ctx: &Context,
        tenant: &str,
        cache_id: CacheId,
        ids: Option<&[String]>,
    ) -> Result<BTreeMap<CacheId, Vec<String>>> {
        let idx = cache_id
            .index_partition()
            .ok_or(Error::UnsupportedCachePrefix)?;
        let ids: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => {
                let prefix = format!("{}{}:", cache_id.prefix(), tenant);
                self.dm
                    .driver()
                    .get_keys_for_prefix(&prefix)
                    .await?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                    .collect()
            }
        };

        let mut touched = BTreeSet::new();
        for id in &ids {
            let entity = self
                .dm
                .get_entity(ctx, cache_id, tenant, id, true, false, NON_TRANSACTIONAL)
                .await?;
            let keys = self
                .keys_for_filters(ctx, tenant, entity.filter_ids(), None, false)
                .await?;
            self.update_indexes(ctx, idx, tenant, id, &keys, &BTreeSet::new())
                .await?;
            for fid in stored_filters(entity.filter_ids()) {
                self.update_reverse(ctx, tenant, fid, idx, id, true).await?;
            }
            touched.extend(keys.iter().map(|k| k.with_tenant(tenant)));
        }
        debug!(partition = %cache_id, items = ids.len(), keys = touched.len(), "indexes computed");
        Ok(BTreeMap::from([(idx, touched.into_iter().collect())]))
    }
}

/// Stored (non-inline) filter IDs.
fn stored_filters(ids: &[String]) -> BTreeSet<&str> {
    ids.iter()
        .map(String::as_str)
        .filter(|id| !Filter::is_inline(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::datamanager::test_support::manager;
    use crate::domain::{Rule, ThresholdProfile};
    use assert_matches::assert_matches;

    fn fltr(id: &str, accounts: &[&str]) -> Filter {
        Filter {
            tenant: "cgrates.org".into(),
            id: id.into(),
            rules: vec![Rule::new("*string", "~*req.Account", accounts).unwrap()],
        }
    }

    fn threshold(id: &str, filters: &[&str]) -> ThresholdProfile {
        ThresholdProfile {
            tenant: "cgrates.org".into(),
            id: id.into(),
            filter_ids: filters.iter().map(|s| s.to_string()).collect(),
            ..ThresholdProfile::default()
        }
    }

    async fn ids_under(dm: &DataManager, key: &str) -> Option<BTreeSet<String>> {
        match dm
            .get_indexes(
                &Context::new(),
                CacheId::ThresholdFilterIndexes,
                "cgrates.org",
                key,
                false,
                false,
            )
            .await
        {
            Ok(mut m) => m.remove(key),
            Err(Error::NotFound) => None,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_entity_moves_between_keys() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", &["1001"]), true).await.unwrap();
        dm.set_item(&ctx, fltr("FLTR_2", &["1002"]), true).await.unwrap();

        dm.set_item(&ctx, threshold("THD_1", &["FLTR_1"]), true).await.unwrap();
        assert!(ids_under(&dm, "*string:*req.Account:1001").await.unwrap().contains("THD_1"));

        dm.set_item(&ctx, threshold("THD_1", &["FLTR_2"]), true).await.unwrap();
        assert!(ids_under(&dm, "*string:*req.Account:1001").await.is_none());
        assert!(ids_under(&dm, "*string:*req.Account:1002").await.unwrap().contains("THD_1"));

        let deps = dm.indexer().filter_dependents(&ctx, "cgrates.org", "FLTR_1").await.unwrap();
        assert!(deps.is_empty());
        let deps = dm.indexer().filter_dependents(&ctx, "cgrates.org", "FLTR_2").await.unwrap();
        assert_eq!(deps["*threshold_filter_indexes"], BTreeSet::from(["THD_1".to_string()]));
    }

    #[tokio::test]
    async fn test_filterless_entity_uses_catch_all() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, threshold("THD_1", &[]), true).await.unwrap();
        assert!(ids_under(&dm, "*none:*any:*any").await.unwrap().contains("THD_1"));

        dm.remove_item::<ThresholdProfile>(&ctx, "cgrates.org", "THD_1", true)
            .await
            .unwrap();
        assert!(ids_under(&dm, "*none:*any:*any").await.is_none());
    }

    #[tokio::test]
    async fn test_filter_change_reindexes_dependents() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", &["1001"]), true).await.unwrap();
        dm.set_item(&ctx, threshold("THD_1", &["FLTR_1"]), true).await.unwrap();

        dm.set_item(&ctx, fltr("FLTR_1", &["2002"]), true).await.unwrap();
        assert!(ids_under(&dm, "*string:*req.Account:1001").await.is_none());
        assert!(ids_under(&dm, "*string:*req.Account:2002").await.unwrap().contains("THD_1"));
    }

    #[tokio::test]
    async fn test_reverse_index_for_filter() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", &["1001", "1002"]), true).await.unwrap();
        dm.set_item(&ctx, threshold("THD_1", &["FLTR_1"]), true).await.unwrap();

        let rev = dm
            .indexer()
            .reverse_index_for_filter(&ctx, "cgrates.org", "FLTR_1")
            .await
            .unwrap();
        assert_eq!(rev.len(), 1);
        assert_eq!(rev[&CacheId::ThresholdFilterIndexes].len(), 2);

        let none = dm
            .indexer()
            .reverse_index_for_filter(&ctx, "cgrates.org", "FLTR_UNUSED")
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_referenced_filter_removal() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", &["1001"]), true).await.unwrap();
        dm.set_item(&ctx, threshold("THD_1", &["FLTR_1"]), true).await.unwrap();

        let res = dm.remove_filter(&ctx, "cgrates.org", "FLTR_1", true, false).await;
        assert_matches!(res, Err(Error::FilterReferenced { dependents, .. })
            if dependents == vec!["*threshold_filter_indexes:THD_1".to_string()]);

        dm.remove_filter(&ctx, "cgrates.org", "FLTR_1", true, true).await.unwrap();
        assert!(ids_under(&dm, "*string:*req.Account:1001").await.is_none());
        assert!(ids_under(&dm, "*none:*any:*any").await.unwrap().contains("THD_1"));
        let deps = dm.indexer().filter_dependents(&ctx, "cgrates.org", "FLTR_1").await.unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn test_compute_indexes_rebuilds() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", &["1001"]), true).await.unwrap();
        dm.set_item(&ctx, threshold("THD_1", &["FLTR_1"]), false).await.unwrap();
        dm.set_item(&ctx, threshold("THD_2", &[]), false).await.unwrap();
        assert!(ids_under(&dm, "*string:*req.Account:1001").await.is_none());

        let touched = dm
            .indexer()
            .compute_indexes(&ctx, "cgrates.org", CacheId::ThresholdProfiles, None)
            .await
            .unwrap();
        assert_eq!(
            touched[&CacheId::ThresholdFilterIndexes],
            vec![
                "cgrates.org:*none:*any:*any".to_string(),
                "cgrates.org:*string:*req.Account:1001".to_string(),
            ]
        );
        assert!(ids_under(&dm, "*string:*req.Account:1001").await.unwrap().contains("THD_1"));
        assert!(ids_under(&dm, "*none:*any:*any").await.unwrap().contains("THD_2"));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::domain::Rule;
    use crate::filters::compute_index_keys;
    use proptest::prelude::*;

    fn literal() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,8}"
    }

    proptest! {
        #[test]
        fn prop_one_key_per_literal_value(
            path in "[A-Za-z]{1,10}",
            values in prop::collection::btree_set(literal(), 1..6),
        ) {
            let element = format!("~*req.{}", path);
            let vals: Vec<&str> = values.iter().map(String::as_str).collect();
            let filter = Filter {
                tenant: "cgrates.org".into(),
                id: "F".into(),
                rules: vec![Rule::new("*string", &element, &vals).unwrap()],
            };
            let keys = compute_index_keys(&filter);
            prop_assert_eq!(keys.len(), values.len());
            for key in keys {
                prop_assert_eq!(key.rule_type.as_str(), "*string");
                prop_assert_eq!(key.a, format!("*req.{}", path));
                prop_assert!(values.contains(&key.b));
            }
        }

        #[test]
        fn prop_tenant_keys_split_back(
            tenant in "[a-z]{1,8}\\.[a-z]{2,3}",
            path in "[A-Za-z.]{1,10}",
            value in literal(),
        ) {
            let key = IndexKey::new("*prefix", format!("*req.{}", path), value);
            let (tnt, parsed) = crate::filters::split_tenant_index_key(&key.with_tenant(&tenant)).unwrap();
            prop_assert_eq!(tnt, tenant);
            prop_assert_eq!(parsed, key);
        }
    }
}
