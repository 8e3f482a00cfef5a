//! Filter index reads and writes.
//!
//! Index entries are cached one key at a time under `<tnt_ctx>:<idx_key>`,
//! grouped by tenant context so a whole context can be dropped at once.

use tracing::{debug, instrument};

use super::{tenant_of, DataManager};
use crate::domain::{
    concatenated_key, CacheId, CacheValue, Context, Envelope, IndexPayload, IndexRef, Indexes,
    NON_TRANSACTIONAL,
};
use crate::error::{Error, Result};
use crate::filters::IndexKey;
use crate::metrics;

impl DataManager {
    /// Read index keys of one tenant context; an empty `idx_key` reads all.
    ///
    /// Keys outside the reverse partition must follow `<type>:<a>:<b>`;
    /// malformed ones fail with `Error::MalformedIndexKey` naming the full
    /// `<tnt_ctx>:<idx_key>`.
    #[instrument(skip(self, ctx), fields(partition = %idx))]
    pub async fn get_indexes(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        idx_key: &str,
        cache_read: bool,
        cache_write: bool,
    ) -> Result<Indexes> {
        let res = self
            .get_indexes_inner(ctx, idx, tnt_ctx, idx_key, cache_read, cache_write)
            .await;
        metrics::record_op("get_indexes", idx.as_str(), &res);
        res
    }

    async fn get_indexes_inner(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        idx_key: &str,
        cache_read: bool,
        cache_write: bool,
    ) -> Result<Indexes> {
        check_index_key(idx, tnt_ctx, idx_key)?;
        let caches = self.caches(idx);

        if cache_read && caches && !idx_key.is_empty() {
            let key = concatenated_key(&[tnt_ctx, idx_key]);
            if let Some(cached) = self.cache.get(idx, &key) {
                return match cached {
                    CacheValue::Index(ids) => Ok(Indexes::from([(idx_key.to_string(), ids)])),
                    CacheValue::Absent => Err(Error::NotFound),
                    CacheValue::Item(_) => Err(Error::Internal(format!(
                        "entity cached under index key {}",
                        key
                    ))),
                };
            }
        }

        let fetched = match self.driver.get_indexes_drv(idx, tnt_ctx, idx_key).await {
            Err(Error::NotFound) if self.partition_cfg(idx).remote && self.conns.has_remote() => {
                self.fetch_remote_indexes(ctx, idx, tnt_ctx, idx_key).await
            }
            other => other,
        };

        let group = [tnt_ctx.to_string()];
        match fetched {
            Ok(indexes) => {
                if cache_write && caches {
                    for (key, ids) in &indexes {
                        self.cache_write(
                            ctx,
                            tenant_of(tnt_ctx),
                            idx,
                            &concatenated_key(&[tnt_ctx, key.as_str()]),
                            CacheValue::Index(ids.clone()),
                            &group,
                            NON_TRANSACTIONAL,
                        )
                        .await?;
                    }
                }
                Ok(indexes)
            }
            Err(Error::NotFound) => {
                if cache_write && caches && !idx_key.is_empty() {
                    self.cache_write(
                        ctx,
                        tenant_of(tnt_ctx),
                        idx,
                        &concatenated_key(&[tnt_ctx, idx_key]),
                        CacheValue::Absent,
                        &group,
                        NON_TRANSACTIONAL,
                    )
                    .await?;
                }
                Err(Error::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_remote_indexes(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        idx_key: &str,
    ) -> Result<Indexes> {
        let env = Envelope::new(
            tenant_of(tnt_ctx),
            ctx.opts().clone(),
            IndexRef {
                cache_id: idx,
                tnt_ctx: tnt_ctx.to_string(),
                idx_key: idx_key.to_string(),
            },
        );
        let env = &env;
        let indexes = self
            .conns
            .fetch_remote(ctx, move |peer| async move { peer.get_indexes(ctx, env).await })
            .await?;
        if self.config.data_db.remote_write_back {
            self.driver
                .set_indexes_drv(idx, tnt_ctx, &indexes, true, NON_TRANSACTIONAL)
                .await?;
        }
        Ok(indexes)
    }

    /// Store index keys of one tenant context.
    ///
    /// An empty ID set deletes its key. With `commit` false the keys are
    /// staged under `txn_id`; a later committing call for the same
    /// transaction makes them visible. Cached copies of the written keys are
    /// evicted, the whole context group on a transaction commit.
    #[instrument(skip(self, ctx, indexes), fields(partition = %idx, keys = indexes.len()))]
    pub async fn set_indexes(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        indexes: &Indexes,
        commit: bool,
        txn_id: &str,
    ) -> Result<()> {
        let res = self
            .set_indexes_inner(ctx, idx, tnt_ctx, indexes, commit, txn_id)
            .await;
        metrics::record_op("set_indexes", idx.as_str(), &res);
        res
    }

    async fn set_indexes_inner(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        indexes: &Indexes,
        commit: bool,
        txn_id: &str,
    ) -> Result<()> {
        for key in indexes.keys() {
            check_index_key(idx, tnt_ctx, key)?;
        }
        self.driver
            .set_indexes_drv(idx, tnt_ctx, indexes, commit, txn_id)
            .await?;

        if self.caches(idx) {
            if commit && txn_id != NON_TRANSACTIONAL {
                self.cache.remove_group(idx, tnt_ctx, NON_TRANSACTIONAL);
            } else {
                for key in indexes.keys() {
                    self.cache.remove(
                        idx,
                        &concatenated_key(&[tnt_ctx, key.as_str()]),
                        NON_TRANSACTIONAL,
                    );
                }
            }
        }
        debug!(tnt_ctx, commit, "indexes stored");

        if !self.partition_cfg(idx).replicate || !self.conns.has_replication() {
            return Ok(());
        }
        let env = Envelope::new(
            tenant_of(tnt_ctx),
            ctx.opts().clone(),
            IndexPayload {
                cache_id: idx,
                tnt_ctx: tnt_ctx.to_string(),
                indexes: indexes.clone(),
                commit,
                txn_id: txn_id.to_string(),
            },
        );
        self.conns
            .replicate(ctx, "set_indexes", move |peer, ctx| {
                let env = env.clone();
                async move { peer.set_indexes(&ctx, &env).await }
            })
            .await
            .map_err(Error::replication)
    }

    /// Delete one index key, or the whole tenant context when `idx_key` is
    /// empty. Deleting something absent is not an error.
    #[instrument(skip(self, ctx), fields(partition = %idx))]
    pub async fn remove_indexes(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        idx_key: &str,
    ) -> Result<()> {
        let res = self.remove_indexes_inner(ctx, idx, tnt_ctx, idx_key).await;
        metrics::record_op("remove_indexes", idx.as_str(), &res);
        res
    }

    async fn remove_indexes_inner(
        &self,
        ctx: &Context,
        idx: CacheId,
        tnt_ctx: &str,
        idx_key: &str,
    ) -> Result<()> {
        check_index_key(idx, tnt_ctx, idx_key)?;
        self.driver.remove_indexes_drv(idx, tnt_ctx, idx_key).await?;
        if self.caches(idx) {
            if idx_key.is_empty() {
                self.cache.remove_group(idx, tnt_ctx, NON_TRANSACTIONAL);
            } else {
                self.cache
                    .remove(idx, &concatenated_key(&[tnt_ctx, idx_key]), NON_TRANSACTIONAL);
            }
        }

        if !self.partition_cfg(idx).replicate || !self.conns.has_replication() {
            return Ok(());
        }
        let env = Envelope::new(
            tenant_of(tnt_ctx),
            ctx.opts().clone(),
            IndexRef {
                cache_id: idx,
                tnt_ctx: tnt_ctx.to_string(),
                idx_key: idx_key.to_string(),
            },
        );
        self.conns
            .replicate(ctx, "remove_indexes", move |peer, ctx| {
                let env = env.clone();
                async move { peer.remove_indexes(&ctx, &env).await }
            })
            .await
            .map_err(Error::replication)
    }
}

fn check_index_key(idx: CacheId, tnt_ctx: &str, idx_key: &str) -> Result<()> {
    if !idx.is_index() {
        return Err(Error::UnsupportedCachePrefix);
    }
    if idx_key.is_empty() || idx == CacheId::ReverseFilterIndexes {
        return Ok(());
    }
    IndexKey::parse(idx_key)
        .map(drop)
        .map_err(|_| Error::MalformedIndexKey(concatenated_key(&[tnt_ctx, idx_key])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::datamanager::test_support::manager;
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_malformed_key_names_tenant_context() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let res = dm
            .get_indexes(&ctx, CacheId::AccountFilterIndexes, "tntCtx", "*prefix:~*accounts", true, true)
            .await;
        let err = res.unwrap_err();
        assert_eq!(err.to_string(), "WRONG_IDX_KEY_FORMAT<tntCtx:*prefix:~*accounts>");
        assert_matches!(err, Error::MalformedIndexKey(k) if k == "tntCtx:*prefix:~*accounts");
    }

    #[tokio::test]
    async fn test_set_get_and_cache() {
        let (dm, tier) = manager(CacheConfig::default());
        let ctx = Context::new();
        let key = "*string:*req.Account:1001";
        let indexes = Indexes::from([(key.to_string(), ids(&["RP_1", "RP_2"]))]);
        dm.set_indexes(&ctx, CacheId::RouteFilterIndexes, "cgrates.org", &indexes, true, NON_TRANSACTIONAL)
            .await
            .unwrap();

        let got = dm
            .get_indexes(&ctx, CacheId::RouteFilterIndexes, "cgrates.org", key, true, true)
            .await
            .unwrap();
        assert_eq!(got, indexes);
        assert!(tier.has_group(CacheId::RouteFilterIndexes, "cgrates.org"));

        let all = dm
            .get_indexes(&ctx, CacheId::RouteFilterIndexes, "cgrates.org", "", false, false)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_set_deletes_key() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let key = "*string:*req.Account:1001".to_string();
        dm.set_indexes(
            &ctx,
            CacheId::RouteFilterIndexes,
            "cgrates.org",
            &Indexes::from([(key.clone(), ids(&["RP_1"]))]),
            true,
            NON_TRANSACTIONAL,
        )
        .await
        .unwrap();
        dm.get_indexes(&ctx, CacheId::RouteFilterIndexes, "cgrates.org", &key, true, true)
            .await
            .unwrap();

        dm.set_indexes(
            &ctx,
            CacheId::RouteFilterIndexes,
            "cgrates.org",
            &Indexes::from([(key.clone(), BTreeSet::new())]),
            true,
            NON_TRANSACTIONAL,
        )
        .await
        .unwrap();
        let res = dm
            .get_indexes(&ctx, CacheId::RouteFilterIndexes, "cgrates.org", &key, true, true)
            .await;
        assert_matches!(res, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_staged_indexes_visible_after_commit() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let key = "*string:*req.Account:1001".to_string();
        dm.set_indexes(
            &ctx,
            CacheId::ChargerFilterIndexes,
            "cgrates.org",
            &Indexes::from([(key.clone(), ids(&["CPP_1"]))]),
            false,
            "txn1",
        )
        .await
        .unwrap();
        let res = dm
            .get_indexes(&ctx, CacheId::ChargerFilterIndexes, "cgrates.org", &key, false, false)
            .await;
        assert_matches!(res, Err(Error::NotFound));

        dm.set_indexes(&ctx, CacheId::ChargerFilterIndexes, "cgrates.org", &Indexes::new(), true, "txn1")
            .await
            .unwrap();
        let got = dm
            .get_indexes(&ctx, CacheId::ChargerFilterIndexes, "cgrates.org", &key, false, false)
            .await
            .unwrap();
        assert_eq!(got[&key], ids(&["CPP_1"]));
    }

    #[tokio::test]
    async fn test_remove_whole_context() {
        let (dm, tier) = manager(CacheConfig::default());
        let ctx = Context::new();
        let indexes = Indexes::from([
            ("*string:*req.Account:1001".to_string(), ids(&["A"])),
            ("*string:*req.Account:1002".to_string(), ids(&["B"])),
        ]);
        dm.set_indexes(&ctx, CacheId::AccountFilterIndexes, "cgrates.org", &indexes, true, NON_TRANSACTIONAL)
            .await
            .unwrap();
        dm.get_indexes(&ctx, CacheId::AccountFilterIndexes, "cgrates.org", "", false, true)
            .await
            .unwrap();
        assert_eq!(tier.group_item_ids(CacheId::AccountFilterIndexes, "cgrates.org").len(), 2);

        dm.remove_indexes(&ctx, CacheId::AccountFilterIndexes, "cgrates.org", "")
            .await
            .unwrap();
        assert!(!tier.has_group(CacheId::AccountFilterIndexes, "cgrates.org"));
        let res = dm
            .get_indexes(&ctx, CacheId::AccountFilterIndexes, "cgrates.org", "", false, false)
            .await;
        assert_matches!(res, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_non_index_partition_rejected() {
        let (dm, _) = manager(CacheConfig::default());
        let ctx = Context::new();
        let res = dm
            .get_indexes(&ctx, CacheId::Filters, "cgrates.org", "", false, false)
            .await;
        assert_matches!(res, Err(Error::UnsupportedCachePrefix));
    }
}
