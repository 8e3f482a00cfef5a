//! In-process replication peer.
//!
//! Applies remote and replicated calls directly to another node's store
//! and evicts the touched keys from that node's cache. Used to wire nodes
//! in one process and in tests; can be switched offline to simulate an
//! unreachable peer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::datamanager::DataManager;
use crate::domain::{
    concatenated_key, CacheId, Context, Entity, Envelope, IndexPayload, IndexRef, Indexes, ItemRef,
    ReplicationPeer, NON_TRANSACTIONAL,
};
use crate::error::{Error, Result};

/// [`ReplicationPeer`] backed by a DataManager in the same process.
pub struct LoopbackPeer {
    name: String,
    dm: Arc<DataManager>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl LoopbackPeer {
    pub fn new(name: impl Into<String>, dm: Arc<DataManager>) -> Self {
        Self {
            name: name.into(),
            dm,
            offline: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every following call fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Calls received, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                conn: self.name.clone(),
                reason: "peer offline".to_string(),
            });
        }
        debug!(conn = %self.name, op, "loopback call");
        Ok(())
    }

    fn evict(&self, cache_id: CacheId, key: &str) {
        self.dm.cache().remove(cache_id, key, NON_TRANSACTIONAL);
    }
}

#[async_trait]
impl ReplicationPeer for LoopbackPeer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_item(&self, _ctx: &Context, args: &Envelope<ItemRef>) -> Result<Entity> {
        self.check("get_item")?;
        self.dm
            .driver()
            .get_item_drv(args.payload.cache_id, &args.tenant, &args.payload.id)
            .await
    }

    async fn set_item(&self, _ctx: &Context, args: &Envelope<Entity>) -> Result<()> {
        self.check("set_item")?;
        let item = &args.payload;
        self.dm.driver().set_item_drv(item).await?;
        self.evict(item.cache_id(), &item.tenant_id());
        Ok(())
    }

    async fn remove_item(&self, _ctx: &Context, args: &Envelope<ItemRef>) -> Result<()> {
        self.check("remove_item")?;
        let ItemRef { cache_id, id } = &args.payload;
        match self.dm.driver().remove_item_drv(*cache_id, &args.tenant, id).await {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.evict(*cache_id, &concatenated_key(&[args.tenant.as_str(), id.as_str()]));
        Ok(())
    }

    async fn get_indexes(&self, _ctx: &Context, args: &Envelope<IndexRef>) -> Result<Indexes> {
        self.check("get_indexes")?;
        let r = &args.payload;
        self.dm
            .driver()
            .get_indexes_drv(r.cache_id, &r.tnt_ctx, &r.idx_key)
            .await
    }

    async fn set_indexes(&self, _ctx: &Context, args: &Envelope<IndexPayload>) -> Result<()> {
        self.check("set_indexes")?;
        let p = &args.payload;
        self.dm
            .driver()
            .set_indexes_drv(p.cache_id, &p.tnt_ctx, &p.indexes, p.commit, &p.txn_id)
            .await?;
        if p.commit && p.txn_id != NON_TRANSACTIONAL {
            self.dm
                .cache()
                .remove_group(p.cache_id, &p.tnt_ctx, NON_TRANSACTIONAL);
        } else {
            for key in p.indexes.keys() {
                self.evict(p.cache_id, &concatenated_key(&[p.tnt_ctx.as_str(), key.as_str()]));
            }
        }
        Ok(())
    }

    async fn remove_indexes(&self, _ctx: &Context, args: &Envelope<IndexRef>) -> Result<()> {
        self.check("remove_indexes")?;
        let r = &args.payload;
        self.dm
            .driver()
            .remove_indexes_drv(r.cache_id, &r.tnt_ctx, &r.idx_key)
            .await?;
        if r.idx_key.is_empty() {
            self.dm
                .cache()
                .remove_group(r.cache_id, &r.tnt_ctx, NON_TRANSACTIONAL);
        } else {
            self.evict(r.cache_id, &concatenated_key(&[r.tnt_ctx.as_str(), r.idx_key.as_str()]));
        }
        Ok(())
    }

    async fn set_load_ids(
        &self,
        _ctx: &Context,
        args: &Envelope<BTreeMap<CacheId, i64>>,
    ) -> Result<()> {
        self.check("set_load_ids")?;
        self.dm.driver().set_load_ids_drv(&args.payload).await
    }
}
