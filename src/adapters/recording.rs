//! Recording doubles for the cache ports.
//!
//! Collect calls in memory for later inspection in tests and dry runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{
    CacheId, CacheItems, CacheService, CacheStore, CacheValue, Context, Envelope, GroupRef,
    ReplicatedValue,
};
use crate::error::{Error, Result};

/// One call received by a [`RecordingCacheService`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Reload(Envelope<CacheItems>),
    Load(Envelope<CacheItems>),
    RemoveItems(Envelope<CacheItems>),
    RemoveGroup(Envelope<GroupRef>),
    Clear(Envelope<Vec<CacheId>>),
    ReplicateSet(Envelope<ReplicatedValue>),
}

type FailureFn = Box<dyn Fn() -> Error + Send + Sync>;

/// [`CacheService`] that records every call and optionally fails them.
pub struct RecordingCacheService {
    name: String,
    calls: Mutex<Vec<RecordedCall>>,
    failure: Mutex<Option<FailureFn>>,
}

impl RecordingCacheService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Record calls but answer each with the produced error.
    pub fn fail_with(&self, f: impl Fn() -> Error + Send + Sync + 'static) {
        *self.failure.lock() = Some(Box::new(f));
    }

    fn record(&self, call: RecordedCall) -> Result<()> {
        self.calls.lock().push(call);
        match self.failure.lock().as_ref() {
            Some(f) => Err(f()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheService for RecordingCacheService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reload_cache(&self, _ctx: &Context, args: &Envelope<CacheItems>) -> Result<()> {
        self.record(RecordedCall::Reload(args.clone()))
    }

    async fn load_cache(&self, _ctx: &Context, args: &Envelope<CacheItems>) -> Result<()> {
        self.record(RecordedCall::Load(args.clone()))
    }

    async fn remove_items(&self, _ctx: &Context, args: &Envelope<CacheItems>) -> Result<()> {
        self.record(RecordedCall::RemoveItems(args.clone()))
    }

    async fn remove_group(&self, _ctx: &Context, args: &Envelope<GroupRef>) -> Result<()> {
        self.record(RecordedCall::RemoveGroup(args.clone()))
    }

    async fn clear(&self, _ctx: &Context, args: &Envelope<Vec<CacheId>>) -> Result<()> {
        self.record(RecordedCall::Clear(args.clone()))
    }

    async fn replicate_set(&self, _ctx: &Context, args: &Envelope<ReplicatedValue>) -> Result<()> {
        self.record(RecordedCall::ReplicateSet(args.clone()))
    }
}

/// Per-operation counters kept by [`CountingCacheStore`].
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub removes: AtomicU64,
}

/// [`CacheStore`] wrapper counting the calls it forwards.
pub struct CountingCacheStore {
    inner: Arc<dyn CacheStore>,
    counters: StoreCounters,
}

impl CountingCacheStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            counters: StoreCounters::default(),
        }
    }

    pub fn gets(&self) -> u64 {
        self.counters.gets.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> u64 {
        self.counters.sets.load(Ordering::Relaxed)
    }

    pub fn removes(&self) -> u64 {
        self.counters.removes.load(Ordering::Relaxed)
    }
}

impl CacheStore for CountingCacheStore {
    fn get(&self, cache_id: CacheId, key: &str) -> Option<CacheValue> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.inner.get(cache_id, key)
    }

    fn set(&self, cache_id: CacheId, key: &str, value: CacheValue, groups: &[String], txn_id: &str) {
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.inner.set(cache_id, key, value, groups, txn_id);
    }

    fn remove(&self, cache_id: CacheId, key: &str, txn_id: &str) {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        self.inner.remove(cache_id, key, txn_id);
    }

    fn remove_group(&self, cache_id: CacheId, group: &str, txn_id: &str) {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        self.inner.remove_group(cache_id, group, txn_id);
    }

    fn clear(&self, cache_ids: &[CacheId]) {
        self.inner.clear(cache_ids);
    }

    fn has_item(&self, cache_id: CacheId, key: &str) -> bool {
        self.inner.has_item(cache_id, key)
    }

    fn item_ids(&self, cache_id: CacheId, prefix: &str) -> Vec<String> {
        self.inner.item_ids(cache_id, prefix)
    }
}
