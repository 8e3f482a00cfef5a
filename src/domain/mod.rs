//! Domain layer: partitions, entities, filters and the ports the data layer
//! depends on.

pub mod context;
pub mod filter;
pub mod model;
pub mod partitions;
pub mod ports;

pub use context::{ApiOpts, CacheStrategy, Context};
pub use filter::{Filter, Operand, Rule, RuleKind, RuleType};
pub use model::*;
pub use partitions::{
    concatenated_key, Capabilities, CacheId, CONCATENATED_KEY_SEP, META_ANY, META_NONE,
    NON_TRANSACTIONAL,
};
pub use ports::{
    CacheItems, CacheService, CacheStore, CacheValue, DataDriver, Envelope, GroupRef, IndexPayload,
    IndexRef, Indexes, ItemRef, ReplicatedValue, ReplicationPeer,
};
