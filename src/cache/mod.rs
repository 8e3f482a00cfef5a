//! Partitioned Cache Tier
//!
//! In-memory cache split by cache ID. Each partition is a sharded map with
//! its own item limit and TTL policy.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         CacheTier                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  *filters   │ *resource_profiles │ ... │ *rfi_ indexes  │ ... │
//! │  ┌────────┐ │ ┌────────┐         │     │ ┌────────┐     │     │
//! │  │ shards │ │ │ shards │         │     │ │ shards │     │     │
//! │  │ groups │ │ │ groups │         │     │ │ groups │     │     │
//! │  └────────┘ │ └────────┘         │     │ └────────┘     │     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Limit 0 disables a partition, -1 leaves it unbounded
//! - Over-limit inserts evict the least recently used entries
//! - TTL is sliding unless the partition is configured static

mod entry;
mod metrics;
mod partition;
mod shard;
mod tier;

pub use entry::{CacheEntry, EntryMetadata};
pub use metrics::{PartitionMetrics, PartitionSnapshot};
pub use partition::CachePartition;
pub use shard::{Shard, ShardedMap};
pub use tier::CacheTier;
