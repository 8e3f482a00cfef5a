//! Filter Index Engine
//!
//! Maps filter rules to index keys and keeps index partitions consistent
//! with the entities and filters they are derived from.
//!
//! - [`index_keys`]: pure key computation and the pluggable [`RuleIndexer`]
//! - [`indexer`]: read-modify-write maintenance of forward and reverse indexes

pub mod index_keys;
pub mod indexer;

pub use index_keys::{
    catch_all_key, catch_all_tenant_key, compute_index_keys, compute_index_keys_with,
    split_tenant_index_key, DynamicOperandIndexer, IndexKey, RuleIndexer,
};
pub use indexer::FilterIndexer;
