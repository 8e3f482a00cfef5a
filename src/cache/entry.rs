//! Cache Entry Types

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::domain::CacheValue;

/// Reference point for entry timestamps.
static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed since the process-wide base instant.
#[inline]
pub(crate) fn now_nanos() -> u64 {
    CLOCK_BASE.elapsed().as_nanos() as u64
}

/// Access metadata for cache entries
#[derive(Debug)]
pub struct EntryMetadata {
    /// Creation timestamp (nanos since base)
    created_at: u64,
    /// Last access timestamp (nanos since base)
    last_access: AtomicU64,
    /// Access count
    access_count: AtomicU32,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryMetadata {
    pub fn new() -> Self {
        let now = now_nanos();
        Self {
            created_at: now,
            last_access: AtomicU64::new(now),
            access_count: AtomicU32::new(0),
        }
    }

    /// Record an access
    #[inline]
    pub fn touch(&self) {
        self.last_access.store(now_nanos(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        Duration::from_nanos(now_nanos().saturating_sub(self.created_at))
    }

    /// Time since last access
    pub fn idle(&self) -> Duration {
        Duration::from_nanos(now_nanos().saturating_sub(self.last_access()))
    }

    /// Check expiry: static TTL counts from creation, sliding TTL from last access.
    pub fn is_expired(&self, ttl: Option<Duration>, static_ttl: bool) -> bool {
        match ttl {
            None => false,
            Some(ttl) if static_ttl => self.age() >= ttl,
            Some(ttl) => self.idle() >= ttl,
        }
    }
}

/// Cached value plus the groups it belongs to
#[derive(Debug)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub groups: Vec<String>,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn new(value: CacheValue, groups: Vec<String>) -> Self {
        Self {
            value,
            groups,
            metadata: EntryMetadata::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_touch_updates_access() {
        let meta = EntryMetadata::new();
        let before = meta.last_access();
        sleep(Duration::from_millis(2));
        meta.touch();
        assert!(meta.last_access() > before);
        assert_eq!(meta.access_count(), 1);
    }

    #[test]
    fn test_static_ttl_ignores_access() {
        let meta = EntryMetadata::new();
        sleep(Duration::from_millis(30));
        meta.touch();
        let ttl = Some(Duration::from_millis(20));
        assert!(meta.is_expired(ttl, true));
        assert!(!meta.is_expired(ttl, false));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let meta = EntryMetadata::new();
        assert!(!meta.is_expired(None, true));
        assert!(!meta.is_expired(None, false));
    }
}
