//! DataManager - the single façade over store, cache and peers
//!
//! Every read and write of a charging entity goes through here:
//!
//! ```text
//!             ┌──────────────────────────────┐
//!   caller ──▶│          DataManager         │──▶ replication peers
//!             │ cache ─▶ store ─▶ remote     │
//!             └──────┬────────────┬──────────┘
//!                    │            │
//!              CacheStore    FilterIndexer ──▶ index partitions
//! ```
//!
//! Reads consult the local cache, then the store, then remote peers in order.
//! Writes validate, persist, refresh filter indexes, bump the partition load
//! marker and fan out to replication peers. Failures after the store write
//! come back as `Error::IndexUpdate` / `Error::Replication`, so callers can
//! tell a rejected write from a committed one with lagging derived state.

mod connections;
mod indexes;
mod items;
mod plans;
mod precache;
mod typed;

pub use connections::{Connections, PeerResult};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::{Config, PartitionConfig};
use crate::domain::{
    CacheId, CacheStore, CacheValue, Context, DataDriver, Envelope, ReplicatedValue,
};
use crate::error::{Error, Result};
use crate::filters::{DynamicOperandIndexer, FilterIndexer, RuleIndexer};
use crate::guardian::Guardian;
use crate::metrics;

/// Data access façade.
///
/// Built once by the composition root and shared behind an `Arc`; the cache
/// tier is injected so tests can substitute a counting or recording store.
pub struct DataManager {
    driver: Arc<dyn DataDriver>,
    cache: Arc<dyn CacheStore>,
    config: Arc<Config>,
    conns: Connections,
    guardian: Arc<Guardian>,
    rule_indexers: Vec<Arc<dyn RuleIndexer>>,
}

impl DataManager {
    pub fn new(driver: Arc<dyn DataDriver>, cache: Arc<dyn CacheStore>, config: Arc<Config>) -> Self {
        let conns = Connections::new(&config.connections);
        let guardian = Arc::new(Guardian::new(config.general.locking_timeout));
        Self {
            driver,
            cache,
            config,
            conns,
            guardian,
            rule_indexers: vec![Arc::new(DynamicOperandIndexer)],
        }
    }

    pub fn with_connections(mut self, conns: Connections) -> Self {
        self.conns = conns;
        self
    }

    /// Share a guardian with other components of the process.
    pub fn with_guardian(mut self, guardian: Arc<Guardian>) -> Self {
        self.guardian = guardian;
        self
    }

    /// Add an index strategy next to the default one.
    pub fn with_rule_indexer(mut self, indexer: Arc<dyn RuleIndexer>) -> Self {
        self.rule_indexers.push(indexer);
        self
    }

    pub fn driver(&self) -> &Arc<dyn DataDriver> {
        &self.driver
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn connections(&self) -> &Connections {
        &self.conns
    }

    pub fn guardian(&self) -> &Arc<Guardian> {
        &self.guardian
    }

    pub fn rule_indexers(&self) -> &[Arc<dyn RuleIndexer>] {
        &self.rule_indexers
    }

    /// Filter index maintenance bound to this manager.
    pub fn indexer(&self) -> FilterIndexer<'_> {
        FilterIndexer::new(self)
    }

    /// Tenant for a call: explicit, then the call options, then the default.
    pub fn resolve_tenant(&self, ctx: &Context, tenant: &str) -> String {
        if !tenant.is_empty() {
            return tenant.to_string();
        }
        ctx.opts()
            .tenant
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.config.general.default_tenant.clone())
    }

    pub(crate) fn partition_cfg(&self, cache_id: CacheId) -> PartitionConfig {
        self.config.partition(cache_id)
    }

    /// Caching is skipped entirely for partitions with a zero limit.
    pub(crate) fn caches(&self, cache_id: CacheId) -> bool {
        !self.partition_cfg(cache_id).is_disabled()
    }

    /// Write a value to the local cache and push it to peer caches when the
    /// partition replicates.
    pub(crate) async fn cache_write(
        &self,
        ctx: &Context,
        tenant: &str,
        cache_id: CacheId,
        key: &str,
        value: CacheValue,
        groups: &[String],
        txn_id: &str,
    ) -> Result<()> {
        let replicate = self.partition_cfg(cache_id).replicate && self.conns.has_cache_replication();
        let pushed = replicate.then(|| value.clone());
        self.cache.set(cache_id, key, value, groups, txn_id);
        let Some(value) = pushed else {
            return Ok(());
        };
        let env = Envelope::new(
            tenant,
            ctx.opts().clone(),
            ReplicatedValue {
                cache_id,
                item_id: key.to_string(),
                value,
                groups: groups.to_vec(),
            },
        );
        self.conns
            .replicate_cache(ctx, "replicate_set", move |svc, ctx| {
                let env = env.clone();
                async move { svc.replicate_set(&ctx, &env).await }
            })
            .await
            .map_err(Error::replication)
    }

    // =========================================================================
    // Load IDs
    // =========================================================================

    /// Current load markers; an empty slice returns every partition.
    #[instrument(skip(self, _ctx))]
    pub async fn get_load_ids(
        &self,
        _ctx: &Context,
        cache_ids: &[CacheId],
    ) -> Result<BTreeMap<CacheId, i64>> {
        let res = self.driver.get_load_ids_drv(cache_ids).await;
        metrics::record_op("get_load_ids", CacheId::LoadIds.as_str(), &res);
        res
    }

    /// Store load markers and replicate them when configured.
    #[instrument(skip(self, ctx, load_ids))]
    pub async fn set_load_ids(&self, ctx: &Context, load_ids: &BTreeMap<CacheId, i64>) -> Result<()> {
        if load_ids.is_empty() {
            return Ok(());
        }
        self.driver.set_load_ids_drv(load_ids).await?;
        if !self.partition_cfg(CacheId::LoadIds).replicate || !self.conns.has_replication() {
            return Ok(());
        }
        let env = Envelope::new(
            self.config.general.default_tenant.clone(),
            ctx.opts().clone(),
            load_ids.clone(),
        );
        self.conns
            .replicate(ctx, "set_load_ids", move |peer, ctx| {
                let env = env.clone();
                async move { peer.set_load_ids(&ctx, &env).await }
            })
            .await
            .map_err(Error::replication)
    }

    /// Move the markers of `cache_ids` forward. The new value is the wall
    /// clock in nanoseconds, or one past the previous marker if the clock lags behind it.
    pub(crate) async fn bump_load_ids(&self, ctx: &Context, cache_ids: &[CacheId]) -> Result<()> {
        let prev = match self.driver.get_load_ids_drv(cache_ids).await {
            Ok(prev) => prev,
            Err(Error::NotFound) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let next: BTreeMap<CacheId, i64> = cache_ids
            .iter()
            .map(|id| {
                let floor = prev.get(id).map(|p| p.saturating_add(1)).unwrap_or(0);
                (*id, now.max(floor))
            })
            .collect();
        debug!(?next, "bumping load ids");
        self.set_load_ids(ctx, &next).await
    }
}

/// Tenant part of a tenant context such as `cgrates.org:RP_1`.
pub(crate) fn tenant_of(tnt_ctx: &str) -> &str {
    tnt_ctx.split(':').next().unwrap_or(tnt_ctx)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::adapters::InternalDb;
    use crate::cache::CacheTier;
    use crate::config::CacheConfig;

    /// Manager over an in-memory store and a fresh cache tier.
    pub fn manager(caches: CacheConfig) -> (Arc<DataManager>, Arc<CacheTier>) {
        let tier = Arc::new(CacheTier::new(&caches));
        let config = Config {
            caches,
            ..Config::default()
        };
        let dm = DataManager::new(Arc::new(InternalDb::new()), tier.clone(), Arc::new(config));
        (Arc::new(dm), tier)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::manager;
    use super::*;
    use crate::config::CacheConfig;
    use crate::domain::ApiOpts;

    #[tokio::test]
    async fn test_resolve_tenant_order() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        assert_eq!(dm.resolve_tenant(&ctx, "itsyscom.com"), "itsyscom.com");
        assert_eq!(dm.resolve_tenant(&ctx, ""), "cgrates.org");

        let ctx = Context::with_opts(ApiOpts {
            tenant: Some("opts.org".into()),
            ..ApiOpts::default()
        });
        assert_eq!(dm.resolve_tenant(&ctx, ""), "opts.org");
    }

    #[tokio::test]
    async fn test_load_ids_are_monotonic() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let far_future = i64::MAX - 10;
        dm.set_load_ids(&ctx, &BTreeMap::from([(CacheId::Filters, far_future)]))
            .await
            .unwrap();

        dm.bump_load_ids(&ctx, &[CacheId::Filters, CacheId::Accounts])
            .await
            .unwrap();
        let ids = dm.get_load_ids(&ctx, &[]).await.unwrap();
        assert_eq!(ids[&CacheId::Filters], far_future + 1);
        assert!(ids[&CacheId::Accounts] > 0);
    }

    #[tokio::test]
    async fn test_load_id_bump_saturates_at_max() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_load_ids(&ctx, &BTreeMap::from([(CacheId::Filters, i64::MAX)]))
            .await
            .unwrap();

        dm.bump_load_ids(&ctx, &[CacheId::Filters]).await.unwrap();
        let ids = dm.get_load_ids(&ctx, &[]).await.unwrap();
        assert_eq!(ids[&CacheId::Filters], i64::MAX);
    }

    #[test]
    fn test_tenant_of() {
        assert_eq!(tenant_of("cgrates.org:RP_1"), "cgrates.org");
        assert_eq!(tenant_of("cgrates.org"), "cgrates.org");
    }
}
