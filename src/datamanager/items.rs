//! Generic entity reads and writes.

use tracing::{debug, info, instrument, warn};

use super::DataManager;
use crate::domain::{
    concatenated_key, CacheId, CacheValue, Context, Entity, Envelope, Filter, Item, ItemRef,
    NON_TRANSACTIONAL,
};
use crate::error::{Error, Result};
use crate::metrics;

impl DataManager {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an entity through cache, store and remote peers.
    ///
    /// With `cache_read` a cached value (including a cached absence) answers
    /// the call. With `cache_write` the outcome of the store lookup, found or
    /// not, is cached under `<tenant>:<id>`.
    #[instrument(skip(self, ctx), fields(partition = %cache_id))]
    pub async fn get_entity(
        &self,
        ctx: &Context,
        cache_id: CacheId,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
        txn_id: &str,
    ) -> Result<Entity> {
        let res = self
            .get_entity_inner(ctx, cache_id, tenant, id, cache_read, cache_write, txn_id)
            .await;
        metrics::record_op("get", cache_id.as_str(), &res);
        res
    }

    async fn get_entity_inner(
        &self,
        ctx: &Context,
        cache_id: CacheId,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
        txn_id: &str,
    ) -> Result<Entity> {
        let key = concatenated_key(&[tenant, id]);
        let caches = self.caches(cache_id);

        if cache_read && caches {
            if let Some(cached) = self.cache.get(cache_id, &key) {
                debug!(key = %key, "cache hit");
                return match cached {
                    CacheValue::Item(entity) => Ok(entity),
                    CacheValue::Absent => Err(Error::NotFound),
                    CacheValue::Index(_) => Err(Error::Internal(format!(
                        "index value cached under item key {}",
                        key
                    ))),
                };
            }
        }

        let fetched = match self.driver.get_item_drv(cache_id, tenant, id).await {
            Err(Error::NotFound) if self.partition_cfg(cache_id).remote && self.conns.has_remote() => {
                self.fetch_remote_item(ctx, cache_id, tenant, id).await
            }
            other => other,
        };

        match fetched {
            Ok(entity) => {
                if cache_write && caches {
                    self.cache_write(
                        ctx,
                        tenant,
                        cache_id,
                        &key,
                        CacheValue::Item(entity.clone()),
                        &[],
                        txn_id,
                    )
                    .await?;
                }
                Ok(entity)
            }
            Err(Error::NotFound) => {
                if cache_write && caches {
                    self.cache_write(ctx, tenant, cache_id, &key, CacheValue::Absent, &[], txn_id)
                        .await?;
                }
                Err(Error::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask remote peers for an entity missing locally, storing it on success
    /// when write-back is enabled.
    async fn fetch_remote_item(
        &self,
        ctx: &Context,
        cache_id: CacheId,
        tenant: &str,
        id: &str,
    ) -> Result<Entity> {
        let env = Envelope::new(
            tenant,
            ctx.opts().clone(),
            ItemRef {
                cache_id,
                id: id.to_string(),
            },
        );
        let env = &env;
        let entity = self
            .conns
            .fetch_remote(ctx, move |peer| async move { peer.get_item(ctx, env).await })
            .await?;
        if self.config.data_db.remote_write_back {
            self.driver.set_item_drv(&entity).await?;
            debug!(partition = %cache_id, tenant, id, "remote entity written back");
        }
        Ok(entity)
    }

    /// Typed read.
    pub async fn get_item<T: Item>(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
        txn_id: &str,
    ) -> Result<T> {
        let entity = self
            .get_entity(ctx, T::CACHE_ID, tenant, id, cache_read, cache_write, txn_id)
            .await?;
        T::from_entity(entity).ok_or_else(|| {
            Error::Internal(format!(
                "{}:{} is not stored as a {}",
                tenant,
                id,
                T::CACHE_ID
            ))
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store an entity.
    ///
    /// Validation and filter reference checks happen before anything is
    /// written. With `with_index` the entity's filter index keys (or, for a
    /// filter, the keys of every entity referencing it) are brought in line
    /// with the new version.
    #[instrument(skip(self, ctx, entity), fields(partition = %entity.cache_id(), id = %entity.id()))]
    pub async fn set_entity(&self, ctx: &Context, entity: Entity, with_index: bool) -> Result<()> {
        let cache_id = entity.cache_id();
        let res = self.set_entity_inner(ctx, entity, with_index).await;
        metrics::record_op("set", cache_id.as_str(), &res);
        res
    }

    async fn set_entity_inner(&self, ctx: &Context, entity: Entity, with_index: bool) -> Result<()> {
        let cache_id = entity.cache_id();
        validate_entity(&entity)?;
        let tenant = entity.tenant().to_string();
        let id = entity.id().to_string();
        self.check_filters(ctx, &tenant, entity.filter_ids()).await?;

        let index = if with_index { cache_id.index_partition() } else { None };
        let reindex_dependents = with_index && cache_id == CacheId::Filters;
        let old = if index.is_some() || reindex_dependents {
            match self
                .get_entity(ctx, cache_id, &tenant, &id, true, false, NON_TRANSACTIONAL)
                .await
            {
                Ok(old) => Some(old),
                Err(Error::NotFound) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        self.driver.set_item_drv(&entity).await?;
        if self.caches(cache_id) {
            self.cache
                .remove(cache_id, &concatenated_key(&[tenant.as_str(), id.as_str()]), NON_TRANSACTIONAL);
        }
        info!(partition = %cache_id, tenant = %tenant, id = %id, "entity stored");

        if let Some(idx) = index {
            self.indexer()
                .index_entity(
                    ctx,
                    idx,
                    &tenant,
                    &id,
                    old.as_ref().map(Entity::filter_ids),
                    Some(entity.filter_ids()),
                )
                .await
                .map_err(Error::index_update)?;
        }
        if reindex_dependents {
            if let Entity::Filter(new) = &entity {
                let old = match &old {
                    Some(Entity::Filter(f)) => Some(f),
                    _ => None,
                };
                self.indexer()
                    .update_filter_dependents(ctx, old, Some(new))
                    .await
                    .map_err(Error::index_update)?;
            }
        }

        self.bump_load_ids(ctx, &[cache_id])
            .await
            .map_err(Error::index_update)?;
        self.replicate_set_item(ctx, &entity).await
    }

    async fn replicate_set_item(&self, ctx: &Context, entity: &Entity) -> Result<()> {
        if !self.partition_cfg(entity.cache_id()).replicate || !self.conns.has_replication() {
            return Ok(());
        }
        let env = Envelope::new(entity.tenant(), ctx.opts().clone(), entity.clone());
        self.conns
            .replicate(ctx, "set_item", move |peer, ctx| {
                let env = env.clone();
                async move { peer.set_item(&ctx, &env).await }
            })
            .await
            .map_err(Error::replication)
    }

    /// Typed write.
    pub async fn set_item<T: Item>(&self, ctx: &Context, item: T, with_index: bool) -> Result<()> {
        self.set_entity(ctx, item.into_entity(), with_index).await
    }

    /// Delete an entity, retracting its index keys when `with_index` is set.
    ///
    /// Removing an absent entity reports `Error::NotFound`. Filters still
    /// referenced by indexed entities are refused; see
    /// [`DataManager::remove_filter`] for the forced variant.
    #[instrument(skip(self, ctx), fields(partition = %cache_id))]
    pub async fn remove_entity(
        &self,
        ctx: &Context,
        cache_id: CacheId,
        tenant: &str,
        id: &str,
        with_index: bool,
    ) -> Result<()> {
        let res = self
            .remove_entity_inner(ctx, cache_id, tenant, id, with_index, false)
            .await;
        metrics::record_op("remove", cache_id.as_str(), &res);
        res
    }

    pub(crate) async fn remove_entity_inner(
        &self,
        ctx: &Context,
        cache_id: CacheId,
        tenant: &str,
        id: &str,
        with_index: bool,
        force: bool,
    ) -> Result<()> {
        let mut missing = Vec::new();
        if tenant.is_empty() {
            missing.push("Tenant");
        }
        if id.is_empty() {
            missing.push("ID");
        }
        if !missing.is_empty() {
            return Err(Error::mandatory(missing));
        }

        let old = self
            .get_entity(ctx, cache_id, tenant, id, true, false, NON_TRANSACTIONAL)
            .await?;

        if with_index && cache_id == CacheId::Filters {
            let dependents = self.indexer().filter_dependents(ctx, tenant, id).await?;
            if !dependents.is_empty() {
                let refs: Vec<String> = dependents
                    .iter()
                    .flat_map(|(partition, ids)| {
                        ids.iter()
                            .map(move |item| concatenated_key(&[partition.as_str(), item.as_str()]))
                    })
                    .collect();
                if !force {
                    return Err(Error::FilterReferenced {
                        filter: concatenated_key(&[tenant, id]),
                        dependents: refs,
                    });
                }
                warn!(tenant, id, dependents = ?refs, "forcing removal of referenced filter");
            }
        }

        self.driver.remove_item_drv(cache_id, tenant, id).await?;
        if self.caches(cache_id) {
            self.cache
                .remove(cache_id, &concatenated_key(&[tenant, id]), NON_TRANSACTIONAL);
        }
        info!(partition = %cache_id, tenant, id, "entity removed");

        if with_index {
            match &old {
                Entity::Filter(f) => self
                    .indexer()
                    .update_filter_dependents(ctx, Some(f), None)
                    .await
                    .map_err(Error::index_update)?,
                _ => {
                    if let Some(idx) = cache_id.index_partition() {
                        self.indexer()
                            .index_entity(ctx, idx, tenant, id, Some(old.filter_ids()), None)
                            .await
                            .map_err(Error::index_update)?;
                    }
                }
            }
        }

        self.bump_load_ids(ctx, &[cache_id])
            .await
            .map_err(Error::index_update)?;
        self.replicate_remove_item(ctx, cache_id, tenant, id).await
    }

    async fn replicate_remove_item(
        &self,
        ctx: &Context,
        cache_id: CacheId,
        tenant: &str,
        id: &str,
    ) -> Result<()> {
        if !self.partition_cfg(cache_id).replicate || !self.conns.has_replication() {
            return Ok(());
        }
        let env = Envelope::new(
            tenant,
            ctx.opts().clone(),
            ItemRef {
                cache_id,
                id: id.to_string(),
            },
        );
        self.conns
            .replicate(ctx, "remove_item", move |peer, ctx| {
                let env = env.clone();
                async move { peer.remove_item(&ctx, &env).await }
            })
            .await
            .map_err(Error::replication)
    }

    /// Typed delete.
    pub async fn remove_item<T: Item>(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        with_index: bool,
    ) -> Result<()> {
        self.remove_entity(ctx, T::CACHE_ID, tenant, id, with_index)
            .await
    }

    // =========================================================================
    // Filter references
    // =========================================================================

    /// Verify every filter ID resolves.
    ///
    /// Inline IDs must parse. Stored IDs are looked up in the cache first (a
    /// cached absence is a broken reference), then in the store, then on
    /// remote peers when the filters partition is remote.
    pub async fn check_filters(&self, ctx: &Context, tenant: &str, filter_ids: &[String]) -> Result<()> {
        let filters_cfg = self.partition_cfg(CacheId::Filters);
        for fid in filter_ids {
            if Filter::is_inline(fid) {
                Filter::from_inline(tenant, fid)?;
                continue;
            }
            if !filters_cfg.is_disabled() {
                match self.cache.get(CacheId::Filters, &concatenated_key(&[tenant, fid.as_str()])) {
                    Some(CacheValue::Absent) => return Err(Error::BrokenReference(fid.clone())),
                    Some(_) => continue,
                    None => {}
                }
            }
            if self.driver.has_item_drv(CacheId::Filters, tenant, fid).await? {
                continue;
            }
            if filters_cfg.remote && self.conns.has_remote() {
                match self.fetch_remote_item(ctx, CacheId::Filters, tenant, fid).await {
                    Ok(_) => continue,
                    Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            return Err(Error::BrokenReference(fid.clone()));
        }
        Ok(())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Store several entities; each one is an independent write.
    pub async fn set_items_batch<T: Item>(
        &self,
        ctx: &Context,
        items: Vec<T>,
        with_index: bool,
    ) -> Result<()> {
        let total = items.len();
        let mut failed = Vec::new();
        let mut first_err = None;
        for item in items {
            let tid = item.tenant_id();
            if let Err(e) = self.set_item(ctx, item, with_index).await {
                warn!(item = %tid, error = %e, "batch set failed");
                failed.push(tid);
                first_err.get_or_insert(e);
            }
        }
        finish_batch(total, failed, first_err)
    }

    /// Remove several entities of one kind and tenant.
    pub async fn remove_items_batch<T: Item>(
        &self,
        ctx: &Context,
        tenant: &str,
        ids: &[String],
        with_index: bool,
    ) -> Result<()> {
        let mut failed = Vec::new();
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.remove_item::<T>(ctx, tenant, id, with_index).await {
                warn!(tenant, id = %id, error = %e, "batch remove failed");
                failed.push(concatenated_key(&[tenant, id.as_str()]));
                first_err.get_or_insert(e);
            }
        }
        finish_batch(ids.len(), failed, first_err)
    }
}

/// A batch where everything failed reports the first error; a batch where
/// only some items failed reports them all as partially executed.
fn finish_batch(total: usize, failed: Vec<String>, first_err: Option<Error>) -> Result<()> {
    match first_err {
        None => Ok(()),
        Some(e) if failed.len() == total => Err(e),
        Some(_) => Err(Error::PartiallyExecuted { failed }),
    }
}

fn validate_entity(entity: &Entity) -> Result<()> {
    if let Entity::Filter(f) = entity {
        f.validate()?;
        if Filter::is_inline(&f.id) {
            return Err(Error::InvalidFilter {
                rule: f.id.clone(),
                reason: "stored filter IDs cannot start with '*'".to_string(),
            });
        }
        return Ok(());
    }
    let mut missing = Vec::new();
    if entity.tenant().is_empty() {
        missing.push("Tenant");
    }
    if entity.id().is_empty() {
        missing.push("ID");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::mandatory(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PartitionConfig};
    use crate::datamanager::test_support::manager;
    use crate::domain::{CacheStore, Rule, ThresholdProfile};
    use assert_matches::assert_matches;

    fn fltr(id: &str, account: &str) -> Filter {
        Filter {
            tenant: "cgrates.org".into(),
            id: id.into(),
            rules: vec![Rule::new("*string", "~*req.Account", &[account]).unwrap()],
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

    #[tokio::test]
    async fn test_get_caches_found_and_absent() {
        let (dm, tier) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", "1001"), true).await.unwrap();

        let got: Filter = dm
            .get_item(&ctx, "cgrates.org", "FLTR_1", true, true, NON_TRANSACTIONAL)
            .await
            .unwrap();
        assert_eq!(got.id, "FLTR_1");
        assert!(tier.has_item(CacheId::Filters, "cgrates.org:FLTR_1"));

        let res = dm
            .get_entity(&ctx, CacheId::Filters, "cgrates.org", "NOPE", true, true, NON_TRANSACTIONAL)
            .await;
        assert_matches!(res, Err(Error::NotFound));
        assert_eq!(
            tier.get(CacheId::Filters, "cgrates.org:NOPE"),
            Some(CacheValue::Absent)
        );
    }

    #[tokio::test]
    async fn test_disabled_partition_is_never_cached() {
        let caches = CacheConfig::default().with_partition(
            CacheId::Filters,
            PartitionConfig {
                limit: 0,
                ..PartitionConfig::default()
            },
        );
        let (dm, tier) = manager(caches);
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", "1001"), false).await.unwrap();
        dm.get_entity(&ctx, CacheId::Filters, "cgrates.org", "FLTR_1", true, true, NON_TRANSACTIONAL)
            .await
            .unwrap();
        assert!(!tier.has_item(CacheId::Filters, "cgrates.org:FLTR_1"));
    }

    #[tokio::test]
    async fn test_broken_reference_rejects_write() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let res = dm
            .set_item(&ctx, threshold("THD_1", &["FLTR_MISSING"]), true)
            .await;
        assert_matches!(res, Err(Error::BrokenReference(f)) if f == "FLTR_MISSING");
        let res = dm
            .get_entity(&ctx, CacheId::ThresholdProfiles, "cgrates.org", "THD_1", false, false, NON_TRANSACTIONAL)
            .await;
        assert_matches!(res, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_cached_absent_filter_is_broken_reference() {
        let (dm, tier) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", "1001"), true).await.unwrap();
        tier.set(
            CacheId::Filters,
            "cgrates.org:FLTR_1",
            CacheValue::Absent,
            &[],
            NON_TRANSACTIONAL,
        );
        let res = dm.set_item(&ctx, threshold("THD_1", &["FLTR_1"]), true).await;
        assert_matches!(res, Err(Error::BrokenReference(_)));
    }

    #[tokio::test]
    async fn test_inline_filters_need_no_storage() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(
            &ctx,
            threshold("THD_1", &["*string:~*req.Account:1001|1002"]),
            true,
        )
        .await
        .unwrap();

        let res = dm.set_item(&ctx, threshold("THD_2", &["*string:~*req.Account"]), true).await;
        assert_matches!(res, Err(Error::MandatoryFieldMissing(_)));
    }

    #[tokio::test]
    async fn test_mandatory_fields() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let res = dm.set_item(&ctx, threshold("", &[]), true).await;
        assert_matches!(res, Err(Error::MandatoryFieldMissing(f)) if f == vec!["ID".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_absent_is_not_found() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let res = dm.remove_item::<ThresholdProfile>(&ctx, "cgrates.org", "THD_1", true).await;
        assert_matches!(res, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_set_evicts_stale_cache_entry() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_item(&ctx, fltr("FLTR_1", "1001"), true).await.unwrap();
        dm.get_entity(&ctx, CacheId::Filters, "cgrates.org", "FLTR_1", true, true, NON_TRANSACTIONAL)
            .await
            .unwrap();
        dm.set_item(&ctx, fltr("FLTR_1", "1002"), true).await.unwrap();
        let got: Filter = dm
            .get_item(&ctx, "cgrates.org", "FLTR_1", true, true, NON_TRANSACTIONAL)
            .await
            .unwrap();
        assert_eq!(got.rules[0].values[0].value(), "1002");
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let res = dm
            .set_items_batch(
                &ctx,
                vec![threshold("THD_1", &[]), threshold("THD_2", &["FLTR_MISSING"])],
                true,
            )
            .await;
        assert_matches!(res, Err(Error::PartiallyExecuted { failed }) if failed == vec!["cgrates.org:THD_2".to_string()]);

        let res = dm
            .remove_items_batch::<ThresholdProfile>(&ctx, "cgrates.org", &["NOPE".to_string()], true)
            .await;
        assert_matches!(res, Err(Error::NotFound));
    }
}
