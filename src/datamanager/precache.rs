//! Bulk cache population from the store.

use tracing::{info, instrument, warn};

use super::DataManager;
use crate::domain::{CacheId, Context, CacheItems, META_ANY, NON_TRANSACTIONAL};
use crate::error::{Error, Result};
use crate::filters::split_tenant_index_key;

impl DataManager {
    /// Load keys of the partition named by `prefix` into the cache.
    ///
    /// `ids` holds cache keys (`<tenant>:<id>` for entities,
    /// `<tnt_ctx>:<type>:<a>:<b>` for index keys); `*any` stands for every
    /// key. With `must_be_cached` only keys already in the cache are
    /// refreshed. Keys missing from the store are cached as absent.
    #[instrument(skip(self, ctx, ids), fields(keys = ids.len()))]
    pub async fn cache_data_from_db(
        &self,
        ctx: &Context,
        prefix: &str,
        ids: &[String],
        must_be_cached: bool,
    ) -> Result<()> {
        let cache_id = CacheId::from_prefix(prefix).map_err(|e| {
            warn!(prefix, "cache load for unknown prefix");
            e
        })?;
        if !self.caches(cache_id) || cache_id == CacheId::LoadIds {
            return Ok(());
        }

        let keys: Vec<String> = if ids.iter().any(|id| id == META_ANY) {
            if must_be_cached {
                self.cache.item_ids(cache_id, "")
            } else {
                self.driver
                    .get_keys_for_prefix(prefix)
                    .await?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(prefix).map(str::to_string))
                    .collect()
            }
        } else {
            ids.to_vec()
        };

        for key in &keys {
            if must_be_cached && !self.cache.has_item(cache_id, key) {
                continue;
            }
            match self.cache_key_from_db(ctx, cache_id, key).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn cache_key_from_db(&self, ctx: &Context, cache_id: CacheId, key: &str) -> Result<()> {
        if cache_id == CacheId::ReverseFilterIndexes {
            let (tnt_ctx, partition) = key
                .rsplit_once(':')
                .filter(|(tnt_ctx, partition)| {
                    !tnt_ctx.is_empty() && partition.parse::<CacheId>().is_ok()
                })
                .ok_or_else(|| Error::MalformedIndexKey(key.to_string()))?;
            return self
                .get_indexes(ctx, cache_id, tnt_ctx, partition, false, true)
                .await
                .map(drop);
        }
        if cache_id.is_index() {
            let (tnt_ctx, idx_key) = split_tenant_index_key(key)?;
            return self
                .get_indexes(ctx, cache_id, &tnt_ctx, &idx_key.to_string(), false, true)
                .await
                .map(drop);
        }
        let (tenant, id) = key
            .split_once(':')
            .ok_or_else(|| Error::Internal(format!("cache key {} is not <tenant>:<id>", key)))?;
        self.get_entity(ctx, cache_id, tenant, id, false, true, NON_TRANSACTIONAL)
            .await
            .map(drop)
    }

    /// Warm every partition configured with `precache`.
    pub async fn precache(&self, ctx: &Context) -> Result<()> {
        let any = [META_ANY.to_string()];
        for cache_id in CacheId::ALL {
            let cfg = self.partition_cfg(*cache_id);
            if !cfg.precache || cfg.is_disabled() {
                continue;
            }
            self.cache_data_from_db(ctx, cache_id.prefix(), &any, false)
                .await?;
            info!(partition = %cache_id, "partition precached");
        }
        Ok(())
    }

    /// Rebuild indexes of `cache_id` for `ids` (all of the tenant's when
    /// `None`) and return the touched index keys for cache refresh.
    pub async fn compute_indexes(
        &self,
        ctx: &Context,
        tenant: &str,
        cache_id: CacheId,
        ids: Option<&[String]>,
    ) -> Result<CacheItems> {
        let tenant = self.resolve_tenant(ctx, tenant);
        self.indexer()
            .compute_indexes(ctx, &tenant, cache_id, ids)
            .await
    }
}
