//! ChargeDB - Data-access and consistency core for real-time charging
//!
//! Sits between the charging services and a durable key/value store. Every
//! management write goes through one façade that keeps four things in step:
//! the stored entity, the in-process cache, the filter indexes used to find
//! candidate profiles for an event, and the load markers other nodes poll.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!   writes ───▶│               DataManager                │
//!              │  validate → store → cache → indexes →    │
//!              │  load IDs → replicate                    │
//!              └───┬──────────────┬──────────────┬────────┘
//!                  │              │              │
//!            ┌─────▼────┐   ┌─────▼─────┐  ┌─────▼──────┐
//!            │DataDriver│   │ CacheTier │  │ Connections│
//!            └──────────┘   └───────────┘  └────────────┘
//!                                 ▲
//!              CacheCoordinator ──┘  (reload / load / remove / clear)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Store driver, cache service and peer implementations
//! - [`cache`] - Partitioned cache tier with LRU limits and TTLs
//! - [`config`] - YAML configuration
//! - [`datamanager`] - The façade over store, cache, indexes and peers
//! - [`domain`] - Partitions, entities, filters and ports
//! - [`error`] - Error taxonomy
//! - [`filters`] - Index key computation and index maintenance
//! - [`guardian`] - Named async locks
//! - [`invalidation`] - Cache invalidation after management writes
//! - [`metrics`] - Prometheus metrics

pub mod adapters;
pub mod cache;
pub mod config;
pub mod datamanager;
pub mod domain;
pub mod error;
pub mod filters;
pub mod guardian;
pub mod invalidation;
pub mod metrics;

// Re-export commonly used types
pub use cache::CacheTier;
pub use config::Config;
pub use datamanager::DataManager;
pub use domain::{CacheId, CacheStrategy, Context};
pub use error::{Error, ErrorKind, Result};
pub use guardian::Guardian;
pub use invalidation::CacheCoordinator;
