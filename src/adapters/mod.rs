//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  DataDriver │ CacheStore │ CacheService │ ReplicationPeer   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InternalDb │ LocalCacheService │ LoopbackPeer              │ │
//! │  │ RecordingCacheService │ CountingCacheStore                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache tier itself ([`crate::cache::CacheTier`]) implements
//! `CacheStore` directly.
//!
//! # Usage
//!
//! ```ignore
//! use chargedb::adapters::{InternalDb, LocalCacheService};
//! use chargedb::cache::CacheTier;
//! use chargedb::datamanager::DataManager;
//!
//! let tier = Arc::new(CacheTier::new(&config.caches));
//! let dm = Arc::new(DataManager::new(Arc::new(InternalDb::new()), tier, config));
//! let cache = LocalCacheService::new("*internal", Arc::clone(&dm));
//! ```

mod internal_db;
mod local_cache;
mod loopback;
mod recording;

pub use internal_db::InternalDb;
pub use local_cache::LocalCacheService;
pub use loopback::LoopbackPeer;
pub use recording::{CountingCacheStore, RecordedCall, RecordingCacheService, StoreCounters};
