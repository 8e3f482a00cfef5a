//! Domain Ports (Port/Adapter Pattern)
//!
//! The data layer talks to its collaborators only through these traits:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DataManager                           │
//! │   DataDriver │ CacheStore │ CacheService │ ReplicationPeer   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Adapters                            │
//! │   InternalDb │ CacheTier │ LocalCacheService │ LoopbackPeer  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::{ApiOpts, Context};
use super::model::Entity;
use super::partitions::CacheId;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Index key → entity IDs, within one partition and tenant context.
pub type Indexes = BTreeMap<String, BTreeSet<String>>;

/// Partition → item IDs, the payload of reload/load/remove calls.
pub type CacheItems = BTreeMap<CacheId, Vec<String>>;

/// Value held by the cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Remembers that the store had nothing under this key
    Absent,
    Item(Entity),
    Index(BTreeSet<String>),
}

/// Tenant + options + payload, the shape of every outbound call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope<T> {
    pub tenant: String,
    #[serde(rename = "APIOpts", default)]
    pub opts: ApiOpts,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(tenant: impl Into<String>, opts: ApiOpts, payload: T) -> Self {
        Self {
            tenant: tenant.into(),
            opts,
            payload,
        }
    }
}

/// Reference to one entity in a partition; tenant comes from the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub cache_id: CacheId,
    pub id: String,
}

/// Reference to index keys of one tenant context; empty key means all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRef {
    pub cache_id: CacheId,
    pub tnt_ctx: String,
    pub idx_key: String,
}

/// Index keys to store under one tenant context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPayload {
    pub cache_id: CacheId,
    pub tnt_ctx: String,
    pub indexes: Indexes,
    pub commit: bool,
    pub txn_id: String,
}

/// Cache group to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub cache_id: CacheId,
    pub group_id: String,
}

/// Cache entry pushed to peer caches after a local cache write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedValue {
    pub cache_id: CacheId,
    pub item_id: String,
    pub value: CacheValue,
    pub groups: Vec<String>,
}

// =============================================================================
// Store Driver
// =============================================================================

/// Durable store, keyed by partition, tenant and ID.
///
/// Absence is always reported as `Error::NotFound`.
#[async_trait]
pub trait DataDriver: Send + Sync {
    async fn get_item_drv(&self, cache_id: CacheId, tenant: &str, id: &str) -> Result<Entity>;

    async fn set_item_drv(&self, item: &Entity) -> Result<()>;

    async fn remove_item_drv(&self, cache_id: CacheId, tenant: &str, id: &str) -> Result<()>;

    async fn has_item_drv(&self, cache_id: CacheId, tenant: &str, id: &str) -> Result<bool>;

    /// Every stored key starting with `prefix`, prefix included.
    async fn get_keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Index keys under a tenant context; an empty `idx_key` returns them all.
    async fn get_indexes_drv(&self, idx: CacheId, tnt_ctx: &str, idx_key: &str)
        -> Result<Indexes>;

    /// Store index keys; an empty set deletes its key. With `commit` false the
    /// keys are staged under `txn_id` until a committing call for the same
    /// transaction.
    async fn set_indexes_drv(
        &self,
        idx: CacheId,
        tnt_ctx: &str,
        indexes: &Indexes,
        commit: bool,
        txn_id: &str,
    ) -> Result<()>;

    async fn remove_indexes_drv(&self, idx: CacheId, tnt_ctx: &str, idx_key: &str)
        -> Result<()>;

    /// Load markers for the given partitions; an empty slice returns all.
    async fn get_load_ids_drv(&self, cache_ids: &[CacheId]) -> Result<BTreeMap<CacheId, i64>>;

    async fn set_load_ids_drv(&self, load_ids: &BTreeMap<CacheId, i64>) -> Result<()>;
}

// =============================================================================
// Cache Store
// =============================================================================

/// In-process partitioned cache.
pub trait CacheStore: Send + Sync {
    fn get(&self, cache_id: CacheId, key: &str) -> Option<CacheValue>;

    fn set(&self, cache_id: CacheId, key: &str, value: CacheValue, groups: &[String], txn_id: &str);

    fn remove(&self, cache_id: CacheId, key: &str, txn_id: &str);

    fn remove_group(&self, cache_id: CacheId, group: &str, txn_id: &str);

    /// Empty slice clears every partition.
    fn clear(&self, cache_ids: &[CacheId]);

    fn has_item(&self, cache_id: CacheId, key: &str) -> bool;

    /// Cached keys of a partition starting with `prefix`.
    fn item_ids(&self, cache_id: CacheId, prefix: &str) -> Vec<String>;
}

// =============================================================================
// Cache Service
// =============================================================================

/// Cache tier of a node, local or remote.
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Connection name for logs and failure reports.
    fn name(&self) -> &str;

    /// Refresh keys that are already cached.
    async fn reload_cache(&self, ctx: &Context, args: &Envelope<CacheItems>) -> Result<()>;

    /// Fetch and cache the given keys.
    async fn load_cache(&self, ctx: &Context, args: &Envelope<CacheItems>) -> Result<()>;

    async fn remove_items(&self, ctx: &Context, args: &Envelope<CacheItems>) -> Result<()>;

    async fn remove_group(&self, ctx: &Context, args: &Envelope<GroupRef>) -> Result<()>;

    /// Drop whole partitions; empty list drops everything.
    async fn clear(&self, ctx: &Context, args: &Envelope<Vec<CacheId>>) -> Result<()>;

    async fn replicate_set(&self, ctx: &Context, args: &Envelope<ReplicatedValue>) -> Result<()>;
}

// =============================================================================
// Replication Peer
// =============================================================================

/// Another node's data layer, used for remote fetches and replication.
#[async_trait]
pub trait ReplicationPeer: Send + Sync {
    fn name(&self) -> &str;

    async fn get_item(&self, ctx: &Context, args: &Envelope<ItemRef>) -> Result<Entity>;

    async fn set_item(&self, ctx: &Context, args: &Envelope<Entity>) -> Result<()>;

    async fn remove_item(&self, ctx: &Context, args: &Envelope<ItemRef>) -> Result<()>;

    async fn get_indexes(&self, ctx: &Context, args: &Envelope<IndexRef>) -> Result<Indexes>;

    async fn set_indexes(&self, ctx: &Context, args: &Envelope<IndexPayload>) -> Result<()>;

    async fn remove_indexes(&self, ctx: &Context, args: &Envelope<IndexRef>) -> Result<()>;

    async fn set_load_ids(
        &self,
        ctx: &Context,
        args: &Envelope<BTreeMap<CacheId, i64>>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let env = Envelope::new(
            "cgrates.org",
            ApiOpts::default(),
            ItemRef {
                cache_id: CacheId::Filters,
                id: "FLTR_1".into(),
            },
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["Tenant"], "cgrates.org");
        assert_eq!(json["Payload"]["cache_id"], "*filters");
    }

    #[test]
    fn test_cache_items_keyed_by_partition_name() {
        let mut items = CacheItems::new();
        items.insert(CacheId::Thresholds, vec!["cgrates.org:THD_1".into()]);
        let json = serde_json::to_string(&items).unwrap();
        assert_eq!(json, r#"{"*thresholds":["cgrates.org:THD_1"]}"#);
    }
}
