//! In-process cache service.
//!
//! Serves cache calls against the node's own cache tier, reloading through
//! the DataManager it belongs to.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::datamanager::DataManager;
use crate::domain::{
    CacheId, CacheItems, CacheService, Context, Envelope, GroupRef, ReplicatedValue,
    NON_TRANSACTIONAL,
};
use crate::error::Result;

/// [`CacheService`] bound to a local DataManager.
#[derive(Clone)]
pub struct LocalCacheService {
    name: String,
    dm: Arc<DataManager>,
}

impl LocalCacheService {
    pub fn new(name: impl Into<String>, dm: Arc<DataManager>) -> Self {
        Self {
            name: name.into(),
            dm,
        }
    }

    async fn load(&self, ctx: &Context, items: &CacheItems, must_be_cached: bool) -> Result<()> {
        for (cache_id, ids) in items {
            if ids.is_empty() {
                continue;
            }
            self.dm
                .cache_data_from_db(ctx, cache_id.prefix(), ids, must_be_cached)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheService for LocalCacheService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reload_cache(&self, ctx: &Context, args: &Envelope<CacheItems>) -> Result<()> {
        self.load(ctx, &args.payload, true).await
    }

    async fn load_cache(&self, ctx: &Context, args: &Envelope<CacheItems>) -> Result<()> {
        self.load(ctx, &args.payload, false).await
    }

    async fn remove_items(&self, _ctx: &Context, args: &Envelope<CacheItems>) -> Result<()> {
        let cache = self.dm.cache();
        for (cache_id, ids) in &args.payload {
            for id in ids {
                cache.remove(*cache_id, id, NON_TRANSACTIONAL);
            }
        }
        Ok(())
    }

    async fn remove_group(&self, _ctx: &Context, args: &Envelope<GroupRef>) -> Result<()> {
        let GroupRef { cache_id, group_id } = &args.payload;
        debug!(partition = %cache_id, group = %group_id, "removing cache group");
        self.dm.cache().remove_group(*cache_id, group_id, NON_TRANSACTIONAL);
        Ok(())
    }

    async fn clear(&self, _ctx: &Context, args: &Envelope<Vec<CacheId>>) -> Result<()> {
        self.dm.cache().clear(&args.payload);
        Ok(())
    }

    async fn replicate_set(&self, _ctx: &Context, args: &Envelope<ReplicatedValue>) -> Result<()> {
        let v = &args.payload;
        self.dm
            .cache()
            .set(v.cache_id, &v.item_id, v.value.clone(), &v.groups, NON_TRANSACTIONAL);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::datamanager::test_support::manager;
    use crate::domain::{ApiOpts, CacheStore, CacheValue, Destination};

    fn env<T>(payload: T) -> Envelope<T> {
        Envelope::new("cgrates.org", ApiOpts::default(), payload)
    }

    #[tokio::test]
    async fn test_load_then_remove() {
        let (dm, tier) = manager(CacheConfig::default());
        let ctx = Context::new();
        dm.set_destination(
            &ctx,
            Destination {
                tenant: "cgrates.org".into(),
                id: "DST_1".into(),
                prefixes: vec!["+49".into()],
            },
            false,
        )
        .await
        .unwrap();
        let svc = LocalCacheService::new("*internal", dm);
        let items = CacheItems::from([(CacheId::Destinations, vec!["cgrates.org:DST_1".to_string()])]);

        svc.reload_cache(&ctx, &env(items.clone())).await.unwrap();
        assert!(!tier.has_item(CacheId::Destinations, "cgrates.org:DST_1"));

        svc.load_cache(&ctx, &env(items.clone())).await.unwrap();
        assert!(tier.has_item(CacheId::Destinations, "cgrates.org:DST_1"));

        svc.remove_items(&ctx, &env(items)).await.unwrap();
        assert!(!tier.has_item(CacheId::Destinations, "cgrates.org:DST_1"));
    }

    #[tokio::test]
    async fn test_replicate_set_and_group_removal() {
        let (dm, tier) = manager(CacheConfig::default());
        let svc = LocalCacheService::new("*internal", dm);
        let ctx = Context::new();
        svc.replicate_set(
            &ctx,
            &env(ReplicatedValue {
                cache_id: CacheId::RouteFilterIndexes,
                item_id: "cgrates.org:*string:*req.Account:1001".into(),
                value: CacheValue::Absent,
                groups: vec!["cgrates.org".into()],
            }),
        )
        .await
        .unwrap();
        assert!(tier.has_group(CacheId::RouteFilterIndexes, "cgrates.org"));

        svc.remove_group(
            &ctx,
            &env(GroupRef {
                cache_id: CacheId::RouteFilterIndexes,
                group_id: "cgrates.org".into(),
            }),
        )
        .await
        .unwrap();
        assert!(!tier.has_item(CacheId::RouteFilterIndexes, "cgrates.org:*string:*req.Account:1001"));
    }
}
