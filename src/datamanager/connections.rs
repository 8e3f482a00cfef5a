//! Peer pools used by the DataManager: remote fetch, replication and
//! cache replication, with a bounded fan-out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{ConnectionsConfig, ReplicationPolicy};
use crate::domain::{CacheService, Context, ReplicationPeer};
use crate::error::{Error, Result};
use crate::metrics;

/// Outcome of one peer call during a fan-out
#[derive(Debug)]
pub struct PeerResult {
    pub conn: String,
    pub result: Result<()>,
}

/// Configured peers and how to talk to them.
#[derive(Clone)]
pub struct Connections {
    remote: Vec<Arc<dyn ReplicationPeer>>,
    replication: Vec<Arc<dyn ReplicationPeer>>,
    cache_replication: Vec<Arc<dyn CacheService>>,
    reply_timeout: Duration,
    policy: ReplicationPolicy,
    concurrency: usize,
}

impl Default for Connections {
    fn default() -> Self {
        Self::new(&ConnectionsConfig::default())
    }
}

impl Connections {
    pub fn new(cfg: &ConnectionsConfig) -> Self {
        Self {
            remote: Vec::new(),
            replication: Vec::new(),
            cache_replication: Vec::new(),
            reply_timeout: cfg.reply_timeout,
            policy: cfg.replication_policy,
            concurrency: cfg.replication_concurrency.max(1),
        }
    }

    /// Peer asked, in order, when the local store misses.
    pub fn with_remote(mut self, peer: Arc<dyn ReplicationPeer>) -> Self {
        self.remote.push(peer);
        self
    }

    /// Peer receiving every replicated write.
    pub fn with_replication(mut self, peer: Arc<dyn ReplicationPeer>) -> Self {
        self.replication.push(peer);
        self
    }

    /// Peer cache receiving values cached locally.
    pub fn with_cache_replication(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache_replication.push(cache);
        self
    }

    pub fn has_remote(&self) -> bool {
        !self.remote.is_empty()
    }

    pub fn has_replication(&self) -> bool {
        !self.replication.is_empty()
    }

    pub fn has_cache_replication(&self) -> bool {
        !self.cache_replication.is_empty()
    }

    pub fn policy(&self) -> ReplicationPolicy {
        self.policy
    }

    /// Ask remote peers in order; the first answer wins. NotFound moves on to
    /// the next peer, as does a transport failure.
    pub async fn fetch_remote<T, F, Fut>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn ReplicationPeer>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = Error::NotFound;
        for peer in &self.remote {
            let name = peer.name().to_string();
            match ctx
                .run(with_timeout(&name, self.reply_timeout, f(Arc::clone(peer))))
                .await
            {
                Ok(value) => {
                    debug!(conn = %name, "remote fetch answered");
                    return Ok(value);
                }
                Err(Error::NotFound) => continue,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(conn = %name, error = %e, "remote fetch failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Run `f` against every replication peer.
    pub async fn replicate<F, Fut>(&self, ctx: &Context, op: &'static str, f: F) -> Result<()>
    where
        F: Fn(Arc<dyn ReplicationPeer>, Context) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let calls = self
            .replication
            .iter()
            .map(|peer| (peer.name().to_string(), f(Arc::clone(peer), ctx.child())))
            .collect();
        self.decide(op, self.fan_out(ctx, calls).await)
    }

    /// Run `f` against every cache replication peer.
    pub async fn replicate_cache<F, Fut>(&self, ctx: &Context, op: &'static str, f: F) -> Result<()>
    where
        F: Fn(Arc<dyn CacheService>, Context) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let calls = self
            .cache_replication
            .iter()
            .map(|cache| (cache.name().to_string(), f(Arc::clone(cache), ctx.child())))
            .collect();
        self.decide(op, self.fan_out(ctx, calls).await)
    }

    /// Spawn every call into one task group, at most `concurrency` in flight,
    /// and collect one result per connection in connection order.
    pub async fn fan_out<Fut>(&self, ctx: &Context, calls: Vec<(String, Fut)>) -> Vec<PeerResult>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let total = calls.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (idx, (conn, fut)) in calls.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let timeout = self.reply_timeout;
            let ctx = ctx.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = ctx.run(with_timeout(&conn, timeout, fut)).await;
                (idx, PeerResult { conn, result })
            });
        }

        let mut results: Vec<(usize, PeerResult)> = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(res) => results.push(res),
                Err(e) => results.push((
                    usize::MAX,
                    PeerResult {
                        conn: "<task>".to_string(),
                        result: Err(Error::Internal(format!("replication task failed: {}", e))),
                    },
                )),
            }
        }
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Apply the replication policy to a fan-out's results.
    fn decide(&self, op: &'static str, results: Vec<PeerResult>) -> Result<()> {
        let total = results.len();
        let mut first_err = None;
        let mut ok = 0usize;
        for PeerResult { conn, result } in results {
            match result {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(op, conn = %conn, error = %e, "replication call failed");
                    metrics::REPLICATION_FAILURES
                        .with_label_values(&[op])
                        .inc();
                    first_err.get_or_insert(e);
                }
            }
        }
        let Some(err) = first_err else {
            return Ok(());
        };
        let satisfied = match self.policy {
            ReplicationPolicy::All => false,
            ReplicationPolicy::Any => ok > 0,
            ReplicationPolicy::Quorum => ok * 2 > total,
        };
        if satisfied {
            debug!(op, ok, total, "replication policy satisfied despite failures");
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Bound a peer call by the reply timeout; zero disables the bound.
async fn with_timeout<T, Fut>(conn: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout {
            conn: conn.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn conns(policy: ReplicationPolicy) -> Connections {
        Connections::new(&ConnectionsConfig {
            reply_timeout: Duration::from_millis(50),
            replication_policy: policy,
            replication_concurrency: 2,
        })
    }

    fn outcome(ok: bool, name: &str) -> (String, impl Future<Output = Result<()>> + Send + 'static) {
        let name = name.to_string();
        let conn = name.clone();
        (name, async move {
            if ok {
                Ok(())
            } else {
                Err(Error::Transport {
                    conn,
                    reason: "refused".into(),
                })
            }
        })
    }

    #[tokio::test]
    async fn test_fan_out_keeps_connection_order() {
        let c = conns(ReplicationPolicy::All);
        let ctx = Context::new();
        let calls = vec![outcome(true, "a"), outcome(false, "b"), outcome(true, "c")];
        let results = c.fan_out(&ctx, calls).await;
        let names: Vec<_> = results.iter().map(|r| r.conn.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(results[1].result.is_err());
    }

    #[tokio::test]
    async fn test_policies() {
        let ctx = Context::new();
        for (policy, expect_ok) in [
            (ReplicationPolicy::All, false),
            (ReplicationPolicy::Any, true),
            (ReplicationPolicy::Quorum, true),
        ] {
            let c = conns(policy);
            let calls = vec![outcome(true, "a"), outcome(false, "b"), outcome(true, "c")];
            let res = c.decide("set_item", c.fan_out(&ctx, calls).await);
            assert_eq!(res.is_ok(), expect_ok, "{:?}", policy);
        }

        let c = conns(ReplicationPolicy::Quorum);
        let calls = vec![outcome(true, "a"), outcome(false, "b")];
        assert_matches!(
            c.decide("set_item", c.fan_out(&ctx, calls).await),
            Err(Error::Transport { conn, .. }) if conn == "b"
        );
    }

    #[tokio::test]
    async fn test_slow_peer_times_out() {
        let c = conns(ReplicationPolicy::All);
        let ctx = Context::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let results = c.fan_out(&ctx, vec![("slow".to_string(), slow)]).await;
        assert_matches!(&results[0].result, Err(Error::Timeout { conn, .. }) if conn == "slow");
    }

    #[tokio::test]
    async fn test_empty_pools_are_noops() {
        let c = conns(ReplicationPolicy::All);
        let ctx = Context::new();
        assert!(c.replicate(&ctx, "noop", |_, _| async { Ok(()) }).await.is_ok());
        let res: Result<()> = c.fetch_remote(&ctx, |_| async { Ok(()) }).await;
        assert_matches!(res, Err(Error::NotFound));
    }
}
