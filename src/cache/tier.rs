//! Cache tier: one [`CachePartition`] per cache ID, plus write transactions.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::metrics::PartitionSnapshot;
use super::partition::CachePartition;
use crate::config::CacheConfig;
use crate::domain::{CacheId, CacheStore, CacheValue, NON_TRANSACTIONAL};

/// Buffered write of an open transaction
#[derive(Debug, Clone)]
enum TxnOp {
    Set {
        cache_id: CacheId,
        key: String,
        value: CacheValue,
        groups: Vec<String>,
    },
    Remove {
        cache_id: CacheId,
        key: String,
    },
    RemoveGroup {
        cache_id: CacheId,
        group: String,
    },
}

/// Partitioned in-memory cache.
///
/// Constructed once by the composition root and shared behind an `Arc`.
pub struct CacheTier {
    partitions: HashMap<CacheId, CachePartition>,
    transactions: Mutex<HashMap<String, Vec<TxnOp>>>,
}

impl CacheTier {
    pub fn new(config: &CacheConfig) -> Self {
        let partitions = CacheId::ALL
            .iter()
            .map(|id| (*id, CachePartition::new(*id, config.partition(*id))))
            .collect();
        Self {
            partitions,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Partition accessor; every cache ID has one.
    pub fn partition(&self, cache_id: CacheId) -> Option<&CachePartition> {
        self.partitions.get(&cache_id)
    }

    pub fn has_group(&self, cache_id: CacheId, group: &str) -> bool {
        self.partition(cache_id)
            .map(|p| p.has_group(group))
            .unwrap_or(false)
    }

    pub fn group_item_ids(&self, cache_id: CacheId, group: &str) -> Vec<String> {
        self.partition(cache_id)
            .map(|p| p.group_item_ids(group))
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Vec<(CacheId, PartitionSnapshot)> {
        let mut out: Vec<_> = self
            .partitions
            .iter()
            .map(|(id, p)| (*id, p.snapshot()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction; writes tagged with the returned ID are buffered.
    pub fn begin_transaction(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.transactions.lock().insert(id.clone(), Vec::new());
        id
    }

    /// Apply the buffered writes in order.
    pub fn commit_transaction(&self, txn_id: &str) {
        let ops = self.transactions.lock().remove(txn_id);
        let Some(ops) = ops else {
            warn!(txn_id, "commit of unknown cache transaction");
            return;
        };
        debug!(txn_id, ops = ops.len(), "committing cache transaction");
        for op in ops {
            self.apply(op);
        }
    }

    pub fn rollback_transaction(&self, txn_id: &str) {
        if self.transactions.lock().remove(txn_id).is_none() {
            warn!(txn_id, "rollback of unknown cache transaction");
        }
    }

    /// Buffer `op` if `txn_id` names an open transaction, otherwise apply it.
    fn submit(&self, txn_id: &str, op: TxnOp) {
        if txn_id != NON_TRANSACTIONAL {
            let mut txns = self.transactions.lock();
            if let Some(ops) = txns.get_mut(txn_id) {
                ops.push(op);
                return;
            }
            warn!(txn_id, "cache write for unknown transaction applied directly");
        }
        self.apply(op);
    }

    fn apply(&self, op: TxnOp) {
        match op {
            TxnOp::Set {
                cache_id,
                key,
                value,
                groups,
            } => {
                if let Some(p) = self.partition(cache_id) {
                    p.set(&key, value, &groups);
                }
            }
            TxnOp::Remove { cache_id, key } => {
                if let Some(p) = self.partition(cache_id) {
                    p.remove(&key);
                }
            }
            TxnOp::RemoveGroup { cache_id, group } => {
                if let Some(p) = self.partition(cache_id) {
                    p.remove_group(&group);
                }
            }
        }
    }
}

impl CacheStore for CacheTier {
    fn get(&self, cache_id: CacheId, key: &str) -> Option<CacheValue> {
        self.partition(cache_id)?.get(key)
    }

    fn set(
        &self,
        cache_id: CacheId,
        key: &str,
        value: CacheValue,
        groups: &[String],
        txn_id: &str,
    ) {
        self.submit(
            txn_id,
            TxnOp::Set {
                cache_id,
                key: key.to_string(),
                value,
                groups: groups.to_vec(),
            },
        );
    }

    fn remove(&self, cache_id: CacheId, key: &str, txn_id: &str) {
        self.submit(
            txn_id,
            TxnOp::Remove {
                cache_id,
                key: key.to_string(),
            },
        );
    }

    fn remove_group(&self, cache_id: CacheId, group: &str, txn_id: &str) {
        self.submit(
            txn_id,
            TxnOp::RemoveGroup {
                cache_id,
                group: group.to_string(),
            },
        );
    }

    fn clear(&self, cache_ids: &[CacheId]) {
        if cache_ids.is_empty() {
            self.partitions.values().for_each(CachePartition::clear);
            return;
        }
        for id in cache_ids {
            if let Some(p) = self.partition(*id) {
                p.clear();
            }
        }
    }

    fn has_item(&self, cache_id: CacheId, key: &str) -> bool {
        self.partition(cache_id)
            .map(|p| p.has_item(key))
            .unwrap_or(false)
    }

    fn item_ids(&self, cache_id: CacheId, prefix: &str) -> Vec<String> {
        self.partition(cache_id)
            .map(|p| p.item_ids(prefix))
            .unwrap_or_default()
    }
}
