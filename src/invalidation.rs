//! Cache Invalidation Coordinator
//!
//! After a management write, tells the cache tier which keys went stale.
//! One write produces at most one cache call; what the call carries depends
//! on the effective caching strategy:
//!
//! | strategy | call                                                        |
//! |----------|-------------------------------------------------------------|
//! | none     | nothing                                                     |
//! | reload   | reload of own, derived and index keys                       |
//! | load     | load of own, derived and index keys                         |
//! | remove   | remove-items of the same keys, or remove-group with a group |
//! | clear    | clear of own, index and derived partitions                  |

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::datamanager::DataManager;
use crate::domain::{
    CacheId, CacheItems, CacheService, CacheStrategy, Context, Envelope, Filter, GroupRef,
    NON_TRANSACTIONAL,
};
use crate::error::Result;
use crate::filters::{catch_all_key, catch_all_tenant_key};
use crate::metrics;

/// One outbound cache call.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheCall {
    Reload(CacheItems),
    Load(CacheItems),
    RemoveItems(CacheItems),
    RemoveGroup(GroupRef),
    Clear(Vec<CacheId>),
}

impl CacheCall {
    /// Method name, for logs and metrics.
    pub fn method(&self) -> &'static str {
        match self {
            CacheCall::Reload(_) => "reload_cache",
            CacheCall::Load(_) => "load_cache",
            CacheCall::RemoveItems(_) => "remove_items",
            CacheCall::RemoveGroup(_) => "remove_group",
            CacheCall::Clear(_) => "clear",
        }
    }

    /// Call for a prepared key mapping; `clear` drops the mapping's partitions.
    fn bulk(strategy: CacheStrategy, items: CacheItems) -> Option<Self> {
        match strategy {
            CacheStrategy::None => None,
            CacheStrategy::Reload => Some(CacheCall::Reload(items)),
            CacheStrategy::Load => Some(CacheCall::Load(items)),
            CacheStrategy::Remove => Some(CacheCall::RemoveItems(items)),
            CacheStrategy::Clear => Some(CacheCall::Clear(items.into_keys().collect())),
        }
    }
}

/// Sends cache invalidation calls on behalf of management writes.
pub struct CacheCoordinator {
    dm: Arc<DataManager>,
    cache: Arc<dyn CacheService>,
}

impl CacheCoordinator {
    pub fn new(dm: Arc<DataManager>, cache: Arc<dyn CacheService>) -> Self {
        Self { dm, cache }
    }

    /// Strategy for a call: explicit, then the call options, then the default.
    pub fn effective_strategy(&self, ctx: &Context, explicit: Option<CacheStrategy>) -> CacheStrategy {
        explicit
            .or(ctx.opts().cache)
            .unwrap_or(self.dm.config().general.default_caching)
    }

    /// Invalidate the cache after a write to one entity.
    ///
    /// `item_id` is the tenant-qualified ID. `filter_ids` of `None` skips
    /// index keys entirely (the entity is gone); an empty list means the
    /// entity sits under the catch-all key.
    #[instrument(skip(self, ctx, filter_ids), fields(partition = %cache_id))]
    pub async fn call_cache(
        &self,
        ctx: &Context,
        strategy: Option<CacheStrategy>,
        tenant: &str,
        cache_id: CacheId,
        item_id: &str,
        group_id: Option<&str>,
        filter_ids: Option<&[String]>,
    ) -> Result<()> {
        let tenant = self.dm.resolve_tenant(ctx, tenant);
        let call = match self.effective_strategy(ctx, strategy) {
            CacheStrategy::None => {
                debug!(item_id, "caching disabled for call");
                return Ok(());
            }
            CacheStrategy::Reload => CacheCall::Reload(
                self.compose_args_reload(ctx, &tenant, cache_id, item_id, filter_ids)
                    .await?,
            ),
            CacheStrategy::Load => CacheCall::Load(
                self.compose_args_reload(ctx, &tenant, cache_id, item_id, filter_ids)
                    .await?,
            ),
            CacheStrategy::Remove => match group_id.filter(|g| !g.is_empty()) {
                Some(group) => CacheCall::RemoveGroup(GroupRef {
                    cache_id,
                    group_id: group.to_string(),
                }),
                None => CacheCall::RemoveItems(
                    self.compose_args_reload(ctx, &tenant, cache_id, item_id, filter_ids)
                        .await?,
                ),
            },
            CacheStrategy::Clear => {
                let caps = cache_id.capabilities();
                let mut ids = vec![cache_id];
                ids.extend(caps.index);
                ids.extend(caps.derived);
                CacheCall::Clear(ids)
            }
        };
        self.dispatch(ctx, &tenant, call).await
    }

    /// Keys to refresh for one entity: its own key, its derived runtime key
    /// and, when `filter_ids` is given, the index keys its filters produce.
    pub async fn compose_args_reload(
        &self,
        ctx: &Context,
        tenant: &str,
        cache_id: CacheId,
        item_id: &str,
        filter_ids: Option<&[String]>,
    ) -> Result<CacheItems> {
        let caps = cache_id.capabilities();
        let mut args = CacheItems::from([(cache_id, vec![item_id.to_string()])]);
        if let Some(derived) = caps.derived {
            args.insert(derived, vec![item_id.to_string()]);
        }
        let (Some(filter_ids), Some(idx)) = (filter_ids, caps.index) else {
            return Ok(args);
        };
        if filter_ids.is_empty() {
            args.insert(idx, vec![catch_all_tenant_key(tenant)]);
            return Ok(args);
        }

        let indexer = self.dm.indexer();
        let mut keys = BTreeSet::new();
        for fid in filter_ids {
            let filter = self
                .dm
                .get_filter(ctx, tenant, fid, true, true, NON_TRANSACTIONAL)
                .await?;
            keys.extend(indexer.compute(&filter));
        }
        if keys.is_empty() {
            keys.insert(catch_all_key());
        }
        args.insert(idx, keys.iter().map(|k| k.with_tenant(tenant)).collect());
        Ok(args)
    }

    /// Invalidate after removing index keys of `cache_id`.
    pub async fn call_cache_for_remove_indexes(
        &self,
        ctx: &Context,
        strategy: Option<CacheStrategy>,
        tenant: &str,
        cache_id: CacheId,
        item_ids: Vec<String>,
    ) -> Result<()> {
        let tenant = self.dm.resolve_tenant(ctx, tenant);
        let items = CacheItems::from([(cache_id, item_ids)]);
        match CacheCall::bulk(self.effective_strategy(ctx, strategy), items) {
            Some(call) => self.dispatch(ctx, &tenant, call).await,
            None => Ok(()),
        }
    }

    /// Invalidate the keys touched by an index rebuild.
    pub async fn call_cache_for_compute_indexes(
        &self,
        ctx: &Context,
        strategy: Option<CacheStrategy>,
        tenant: &str,
        cache_items: CacheItems,
    ) -> Result<()> {
        let tenant = self.dm.resolve_tenant(ctx, tenant);
        match CacheCall::bulk(self.effective_strategy(ctx, strategy), cache_items) {
            Some(call) => self.dispatch(ctx, &tenant, call).await,
            None => Ok(()),
        }
    }

    /// Invalidate a batch of keys of one partition; nothing is sent for an
    /// empty batch.
    pub async fn call_cache_multiple(
        &self,
        ctx: &Context,
        strategy: Option<CacheStrategy>,
        tenant: &str,
        cache_id: CacheId,
        item_ids: &[String],
    ) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let tenant = self.dm.resolve_tenant(ctx, tenant);
        let items = CacheItems::from([(cache_id, item_ids.to_vec())]);
        match CacheCall::bulk(self.effective_strategy(ctx, strategy), items) {
            Some(call) => self.dispatch(ctx, &tenant, call).await,
            None => Ok(()),
        }
    }

    /// Add to `args` the index keys `filter` contributes in every index
    /// partition holding entities that reference it.
    pub async fn compose_cache_args_for_filter(
        &self,
        ctx: &Context,
        filter: &Filter,
        tenant: &str,
        args: &mut CacheItems,
    ) -> Result<()> {
        let mut keys = self.dm.indexer().compute(filter);
        if keys.is_empty() {
            keys.push(catch_all_key());
        }
        let deps = self
            .dm
            .indexer()
            .filter_dependents(ctx, tenant, &filter.id)
            .await?;
        for partition in deps.keys() {
            let idx: CacheId = partition.parse()?;
            let entry = args.entry(idx).or_default();
            for key in &keys {
                let key = key.with_tenant(tenant);
                if !entry.contains(&key) {
                    entry.push(key);
                }
            }
        }
        Ok(())
    }

    /// Invalidate the keys composed for a filter change.
    pub async fn call_cache_for_filter(
        &self,
        ctx: &Context,
        strategy: Option<CacheStrategy>,
        tenant: &str,
        args: CacheItems,
    ) -> Result<()> {
        self.call_cache_for_compute_indexes(ctx, strategy, tenant, args)
            .await
    }

    async fn dispatch(&self, ctx: &Context, tenant: &str, call: CacheCall) -> Result<()> {
        let delay = self.dm.config().general.caching_delay;
        if !delay.is_zero() {
            debug!(?delay, "delaying cache call");
            tokio::time::sleep(delay).await;
        }
        let method = call.method();
        metrics::CACHE_CALLS.with_label_values(&[method]).inc();
        debug!(method, conn = self.cache.name(), "sending cache call");

        let opts = ctx.opts().clone();
        let svc = &self.cache;
        match call {
            CacheCall::Reload(items) => {
                ctx.run(svc.reload_cache(ctx, &Envelope::new(tenant, opts, items)))
                    .await
            }
            CacheCall::Load(items) => {
                ctx.run(svc.load_cache(ctx, &Envelope::new(tenant, opts, items)))
                    .await
            }
            CacheCall::RemoveItems(items) => {
                ctx.run(svc.remove_items(ctx, &Envelope::new(tenant, opts, items)))
                    .await
            }
            CacheCall::RemoveGroup(group) => {
                ctx.run(svc.remove_group(ctx, &Envelope::new(tenant, opts, group)))
                    .await
            }
            CacheCall::Clear(ids) => {
                ctx.run(svc.clear(ctx, &Envelope::new(tenant, opts, ids)))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InternalDb, RecordedCall, RecordingCacheService};
    use crate::cache::CacheTier;
    use crate::config::{CacheConfig, Config};
    use crate::domain::{ApiOpts, Rule, ThresholdProfile};
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn setup(config: Config) -> (Arc<DataManager>, Arc<RecordingCacheService>, CacheCoordinator) {
        let tier = Arc::new(CacheTier::new(&CacheConfig::default()));
        let dm = Arc::new(DataManager::new(Arc::new(InternalDb::new()), tier, Arc::new(config)));
        let rec = Arc::new(RecordingCacheService::new("*internal"));
        let coord = CacheCoordinator::new(Arc::clone(&dm), rec.clone());
        (dm, rec, coord)
    }

    async fn with_filter(dm: &DataManager) {
        dm.set_filter(
            &Context::new(),
            Filter {
                tenant: "cgrates.org".into(),
                id: "FLTR_1".into(),
                rules: vec![Rule::new("*string", "~*req.Account", &["1001", "1002"]).unwrap()],
            },
            true,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reload_composes_own_derived_and_index_keys() {
        let (dm, rec, coord) = setup(Config::default());
        with_filter(&dm).await;
        coord
            .call_cache(
                &Context::new(),
                Some(CacheStrategy::Reload),
                "cgrates.org",
                CacheId::ThresholdProfiles,
                "cgrates.org:THD_1",
                None,
                Some(&["FLTR_1".to_string()]),
            )
            .await
            .unwrap();

        let calls = rec.calls();
        assert_eq!(calls.len(), 1);
        let RecordedCall::Reload(env) = &calls[0] else {
            panic!("expected reload, got {:?}", calls[0]);
        };
        assert_eq!(env.tenant, "cgrates.org");
        assert_eq!(env.payload[&CacheId::ThresholdProfiles], vec!["cgrates.org:THD_1"]);
        assert_eq!(env.payload[&CacheId::Thresholds], vec!["cgrates.org:THD_1"]);
        assert_eq!(
            env.payload[&CacheId::ThresholdFilterIndexes],
            vec![
                "cgrates.org:*string:*req.Account:1001",
                "cgrates.org:*string:*req.Account:1002"
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_id_presence_controls_index_keys() {
        let (_, rec, coord) = setup(Config::default());
        let ctx = Context::new();
        coord
            .call_cache(&ctx, None, "", CacheId::RouteProfiles, "cgrates.org:RP_1", None, None)
            .await
            .unwrap();
        coord
            .call_cache(&ctx, None, "", CacheId::RouteProfiles, "cgrates.org:RP_1", None, Some(&[]))
            .await
            .unwrap();

        let calls = rec.calls();
        let RecordedCall::Reload(removed) = &calls[0] else {
            panic!("expected reload");
        };
        assert!(!removed.payload.contains_key(&CacheId::RouteFilterIndexes));
        let RecordedCall::Reload(filterless) = &calls[1] else {
            panic!("expected reload");
        };
        assert_eq!(
            filterless.payload[&CacheId::RouteFilterIndexes],
            vec!["cgrates.org:*none:*any:*any"]
        );
    }

    #[tokio::test]
    async fn test_strategies() {
        let (_, rec, coord) = setup(Config::default());
        let ctx = Context::new();
        for strategy in [
            CacheStrategy::None,
            CacheStrategy::Remove,
            CacheStrategy::Clear,
            CacheStrategy::Load,
        ] {
            coord
                .call_cache(
                    &ctx,
                    Some(strategy),
                    "cgrates.org",
                    CacheId::ResourceProfiles,
                    "cgrates.org:RES_1",
                    None,
                    None,
                )
                .await
                .unwrap();
        }
        coord
            .call_cache(
                &ctx,
                Some(CacheStrategy::Remove),
                "cgrates.org",
                CacheId::ResourceProfiles,
                "cgrates.org:RES_1",
                Some("GRP_1"),
                None,
            )
            .await
            .unwrap();

        let calls = rec.calls();
        assert_eq!(calls.len(), 4);
        assert_matches!(&calls[0], RecordedCall::RemoveItems(env) if env.payload.len() == 2);
        assert_matches!(&calls[1], RecordedCall::Clear(env) if env.payload == vec![
            CacheId::ResourceProfiles,
            CacheId::ResourceFilterIndexes,
            CacheId::Resources,
        ]);
        assert_matches!(&calls[2], RecordedCall::Load(_));
        assert_matches!(&calls[3], RecordedCall::RemoveGroup(env) if env.payload.group_id == "GRP_1");
    }

    #[tokio::test]
    async fn test_call_options_override_default() {
        let (_, rec, coord) = setup(Config::default());
        let ctx = Context::with_opts(ApiOpts {
            cache: Some(CacheStrategy::None),
            tenant: Some("opts.org".into()),
            ..ApiOpts::default()
        });
        coord
            .call_cache(&ctx, None, "", CacheId::Destinations, "opts.org:DST_1", None, None)
            .await
            .unwrap();
        assert!(rec.calls().is_empty());

        coord
            .call_cache_multiple(&ctx, Some(CacheStrategy::Reload), "", CacheId::Destinations, &["opts.org:DST_1".to_string()])
            .await
            .unwrap();
        assert_matches!(&rec.calls()[0], RecordedCall::Reload(env) if env.tenant == "opts.org");
    }

    #[tokio::test]
    async fn test_multiple_skips_empty_batch() {
        let (_, rec, coord) = setup(Config::default());
        coord
            .call_cache_multiple(&Context::new(), Some(CacheStrategy::Clear), "", CacheId::Destinations, &[])
            .await
            .unwrap();
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_clear_uses_mapping_partitions() {
        let (_, rec, coord) = setup(Config::default());
        let items = CacheItems::from([
            (CacheId::AccountFilterIndexes, vec!["cgrates.org:*none:*any:*any".to_string()]),
            (CacheId::ChargerFilterIndexes, vec![]),
        ]);
        coord
            .call_cache_for_compute_indexes(&Context::new(), Some(CacheStrategy::Clear), "", items)
            .await
            .unwrap();
        coord
            .call_cache_for_remove_indexes(
                &Context::new(),
                Some(CacheStrategy::Clear),
                "",
                CacheId::RouteFilterIndexes,
                vec![],
            )
            .await
            .unwrap();
        let calls = rec.calls();
        assert_matches!(&calls[0], RecordedCall::Clear(env) if env.payload == vec![
            CacheId::ChargerFilterIndexes,
            CacheId::AccountFilterIndexes,
        ]);
        assert_matches!(&calls[1], RecordedCall::Clear(env) if env.payload == vec![CacheId::RouteFilterIndexes]);
    }

    #[tokio::test]
    async fn test_filter_args_follow_reverse_index() {
        let (dm, rec, coord) = setup(Config::default());
        with_filter(&dm).await;
        let ctx = Context::new();
        dm.set_threshold_profile(
            &ctx,
            ThresholdProfile {
                tenant: "cgrates.org".into(),
                id: "THD_1".into(),
                filter_ids: vec!["FLTR_1".into()],
                ..ThresholdProfile::default()
            },
            true,
        )
        .await
        .unwrap();

        let filter: Filter = dm
            .get_filter(&ctx, "cgrates.org", "FLTR_1", true, true, NON_TRANSACTIONAL)
            .await
            .unwrap();
        let mut args = CacheItems::from([(CacheId::Filters, vec!["cgrates.org:FLTR_1".to_string()])]);
        coord
            .compose_cache_args_for_filter(&ctx, &filter, "cgrates.org", &mut args)
            .await
            .unwrap();
        assert_eq!(args[&CacheId::ThresholdFilterIndexes].len(), 2);
        assert!(!args.contains_key(&CacheId::RouteFilterIndexes));

        coord
            .call_cache_for_filter(&ctx, None, "cgrates.org", args)
            .await
            .unwrap();
        assert_matches!(&rec.calls()[0], RecordedCall::Reload(_));
    }

    #[tokio::test]
    async fn test_unknown_filter_fails_composition() {
        let (_, rec, coord) = setup(Config::default());
        let res = coord
            .call_cache(
                &Context::new(),
                Some(CacheStrategy::Reload),
                "cgrates.org",
                CacheId::ChargerProfiles,
                "cgrates.org:CPP_1",
                None,
                Some(&["FLTR_NOPE".to_string()]),
            )
            .await;
        assert_matches!(res, Err(Error::NotFound));
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_service_failure_returned() {
        let (_, rec, coord) = setup(Config::default());
        rec.fail_with(|| Error::Transport {
            conn: "*internal".into(),
            reason: "down".into(),
        });
        let res = coord
            .call_cache(
                &Context::new(),
                Some(CacheStrategy::Clear),
                "",
                CacheId::Destinations,
                "cgrates.org:DST_1",
                None,
                None,
            )
            .await;
        assert_matches!(res, Err(Error::Transport { .. }));
    }
}
