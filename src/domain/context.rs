//! Per-call context: cancellation plus caller options.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// What the cache tier should do after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheStrategy {
    #[serde(rename = "*none")]
    None,
    #[default]
    #[serde(rename = "*reload")]
    Reload,
    #[serde(rename = "*load")]
    Load,
    #[serde(rename = "*remove")]
    Remove,
    #[serde(rename = "*clear")]
    Clear,
}

impl CacheStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStrategy::None => "*none",
            CacheStrategy::Reload => "*reload",
            CacheStrategy::Load => "*load",
            CacheStrategy::Remove => "*remove",
            CacheStrategy::Clear => "*clear",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "*none" => Ok(CacheStrategy::None),
            "*reload" => Ok(CacheStrategy::Reload),
            "*load" => Ok(CacheStrategy::Load),
            "*remove" => Ok(CacheStrategy::Remove),
            "*clear" => Ok(CacheStrategy::Clear),
            other => Err(Error::Config(format!("unknown caching strategy: {}", other))),
        }
    }
}

/// Options a caller attaches to a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiOpts {
    /// Overrides the configured caching strategy
    #[serde(rename = "*cache", default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStrategy>,
    /// Overrides the configured default tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Free-form options forwarded to peers
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Cancellation scope and options for one façade call.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    opts: ApiOpts,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opts(opts: ApiOpts) -> Self {
        Self {
            token: CancellationToken::new(),
            opts,
        }
    }

    /// Context sharing these options, cancelled with its parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            opts: self.opts.clone(),
        }
    }

    pub fn opts(&self) -> &ApiOpts {
        &self.opts
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Drive a remote call, abandoning it if the context is cancelled.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("*clear".parse::<CacheStrategy>().unwrap(), CacheStrategy::Clear);
        assert!("clear".parse::<CacheStrategy>().is_err());
        assert_eq!(CacheStrategy::default(), CacheStrategy::Reload);
    }

    #[test]
    fn test_opts_serde() {
        let opts: ApiOpts =
            serde_json::from_str(r#"{"*cache":"*none","Tenant":"itsyscom.com","*ttl":5}"#)
                .unwrap();
        assert_eq!(opts.cache, Some(CacheStrategy::None));
        assert_eq!(opts.tenant.as_deref(), Some("itsyscom.com"));
        assert_eq!(opts.extra["*ttl"], 5);
    }

    #[tokio::test]
    async fn test_run_aborts_on_cancel() {
        let ctx = Context::new();
        let child = ctx.child();
        ctx.cancel();
        let res: Result<()> = child
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_matches!(res, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = Context::new();
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
    }
}
