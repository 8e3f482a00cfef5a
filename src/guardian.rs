//! Guardian: named, timeout-bounded advisory locks.
//!
//! Read-modify-write sequences that must not interleave (action plan account
//! sets, rating profile rewrites, index partitions) run inside
//! [`Guardian::guard`]. Lock names are a domain tag plus an entity ID.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Build a lock name from a domain tag and an ID.
pub fn lock_key(tag: &str, id: &str) -> String {
    format!("{}{}", tag, id)
}

/// Registry of named locks.
#[derive(Debug)]
pub struct Guardian {
    locks: DashMap<String, Arc<Mutex<()>>>,
    default_timeout: Duration,
}

impl Default for Guardian {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Guardian {
    /// `default_timeout` of zero waits indefinitely.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of lock names currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Run `f` while holding every lock in `keys`.
    ///
    /// Keys are taken in sorted order. If any lock is not obtained before the
    /// timeout (the default one when `None`), nothing runs and
    /// `Error::LockTimeout` names the lock that was waited on.
    pub async fn guard<F, Fut, T>(&self, keys: &[String], timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = Arc::clone(
                self.locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .value(),
            );
            let guard = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        drop(guards);
                        self.reap(&keys);
                        warn!(key = %key, ?timeout, "guardian lock timed out");
                        return Err(Error::LockTimeout {
                            key: key.clone(),
                            timeout,
                        });
                    }
                },
                None => lock.lock_owned().await,
            };
            guards.push(guard);
        }
        trace!(?keys, "guardian locks acquired");

        let res = f().await;

        drop(guards);
        self.reap(&keys);
        trace!(?keys, "guardian locks released");
        res
    }

    /// Forget locks nobody holds or waits for.
    fn reap(&self, keys: &[String]) {
        for key in keys {
            self.locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_guard_runs_closure_and_releases() {
        let g = Guardian::new(Duration::from_secs(1));
        let out = g
            .guard(&[lock_key("apl_", "AP1")], None, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(g.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_guard_serializes_same_key() {
        let g = Arc::new(Guardian::new(Duration::from_secs(5)));
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let g = Arc::clone(&g);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            set.spawn(async move {
                g.guard(&["rpf_RP1".to_string()], None, || async {
                    let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(g.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_guard_times_out() {
        let g = Arc::new(Guardian::new(Duration::from_millis(20)));
        let key = vec!["apl_AP1".to_string()];

        let holder = {
            let g = Arc::clone(&g);
            let key = key.clone();
            tokio::spawn(async move {
                g.guard(&key, Some(Duration::from_secs(1)), || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ran = Arc::new(SyncMutex::new(false));
        let ran2 = Arc::clone(&ran);
        let res = g
            .guard(&key, None, || async move {
                *ran2.lock() = true;
                Ok(())
            })
            .await;
        assert_matches!(res, Err(Error::LockTimeout { key, .. }) if key == "apl_AP1");
        assert!(!*ran.lock());

        holder.await.unwrap().unwrap();
    }

    #[test]
    fn test_guard_outside_async_test() {
        let g = Guardian::default();
        let res = tokio_test::block_on(g.guard(&[lock_key("rpf_", "RP1")], None, || async {
            Ok("done")
        }));
        tokio_test::assert_ok!(&res);
        assert_eq!(g.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let g = Guardian::new(Duration::from_millis(50));
        let res = g
            .guard(&["a".to_string()], None, || async {
                g.guard(&["b".to_string()], None, || async { Ok(1) }).await
            })
            .await;
        assert_eq!(res.unwrap(), 1);
    }
}
