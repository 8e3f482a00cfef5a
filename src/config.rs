//! Configuration for the data layer.
//!
//! Loaded from YAML; every section has defaults so an empty document is a
//! valid configuration.
//!
//! ```yaml
//! general:
//!   default_tenant: cgrates.org
//!   default_caching: "*reload"
//!   locking_timeout: 5s
//! caches:
//!   partitions:
//!     "*filters": { limit: -1, ttl: 0s, precache: true }
//!     "*resources": { limit: 0 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{CacheId, CacheStrategy};
use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub data_db: DataDbConfig,
    pub caches: CacheConfig,
    pub connections: ConnectionsConfig,
}

impl Config {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let cfg: Config = if raw.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.default_tenant.is_empty() {
            return Err(Error::Config("general.default_tenant is empty".to_string()));
        }
        for (id, part) in &self.caches.partitions {
            if part.limit < -1 {
                return Err(Error::Config(format!(
                    "caches.partitions.{}.limit must be -1, 0 or positive, got {}",
                    id, part.limit
                )));
            }
        }
        if self.connections.replication_concurrency == 0 {
            return Err(Error::Config(
                "connections.replication_concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Partition settings, falling back to an unbounded partition.
    pub fn partition(&self, cache_id: CacheId) -> PartitionConfig {
        self.caches.partition(cache_id)
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Tenant used when a call names none
    pub default_tenant: String,
    /// Strategy used when a call names none
    pub default_caching: CacheStrategy,
    /// Upper bound on guardian lock acquisition; zero waits indefinitely
    #[serde(with = "duration_str")]
    pub locking_timeout: Duration,
    /// Pause before notifying the cache tier after a write
    #[serde(with = "duration_str")]
    pub caching_delay: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_tenant: "cgrates.org".to_string(),
            default_caching: CacheStrategy::Reload,
            locking_timeout: Duration::from_secs(5),
            caching_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDbConfig {
    /// Persist entities fetched from a remote peer into the local store
    pub remote_write_back: bool,
}

impl Default for DataDbConfig {
    fn default() -> Self {
        Self {
            remote_write_back: true,
        }
    }
}

/// Behaviour of one cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Maximum cached items: 0 disables caching, -1 is unbounded
    pub limit: i64,
    /// Entry lifetime; zero never expires
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    /// TTL counts from insertion instead of last access
    pub static_ttl: bool,
    /// Push writes to replication peers
    pub replicate: bool,
    /// Fetch from remote peers on local miss
    pub remote: bool,
    /// Warm the partition at startup
    pub precache: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            limit: -1,
            ttl: Duration::ZERO,
            static_ttl: false,
            replicate: false,
            remote: false,
            precache: false,
        }
    }
}

impl PartitionConfig {
    pub fn is_disabled(&self) -> bool {
        self.limit == 0
    }

    /// Item bound, `None` when unbounded.
    pub fn max_items(&self) -> Option<usize> {
        (self.limit > 0).then_some(self.limit as usize)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (!self.ttl.is_zero()).then_some(self.ttl)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub partitions: BTreeMap<CacheId, PartitionConfig>,
}

impl CacheConfig {
    pub fn partition(&self, cache_id: CacheId) -> PartitionConfig {
        self.partitions.get(&cache_id).copied().unwrap_or_default()
    }

    /// Builder helper used by tests and the composition root.
    pub fn with_partition(mut self, cache_id: CacheId, cfg: PartitionConfig) -> Self {
        self.partitions.insert(cache_id, cfg);
        self
    }
}

/// How many replication peers must acknowledge a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationPolicy {
    /// Every peer; the first failure is returned
    #[default]
    All,
    /// At least one peer
    Any,
    /// A strict majority of peers
    Quorum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Bound on a single remote or replication call
    #[serde(with = "duration_str")]
    pub reply_timeout: Duration,
    pub replication_policy: ReplicationPolicy,
    /// Peers contacted at once during a fan-out
    pub replication_concurrency: usize,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            replication_policy: ReplicationPolicy::All,
            replication_concurrency: 8,
        }
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration such as `30s`, `500ms`, `1h30m` or `2d`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c);
            chars.next();
        }
        if num_buf.is_empty() {
            return Err(Error::DurationParse(format!(
                "invalid number in duration: {}",
                s
            )));
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        total += match unit.to_ascii_lowercase().as_str() {
            "" | "s" => Duration::from_secs(num),
            "ms" => Duration::from_millis(num),
            "us" => Duration::from_micros(num),
            "ns" => Duration::from_nanos(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            "d" => Duration::from_secs(num * 86400),
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
    }

    Ok(total)
}

/// Render a duration in the format accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else if d.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}ns", d.as_nanos())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
