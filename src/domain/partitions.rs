//! Cache partitions and the static capability table.
//!
//! Every entity kind lives in its own partition. The table below records,
//! per partition, its store prefix and which index partition and derived
//! runtime partition must be refreshed together with it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Separator for composite keys.
pub const CONCATENATED_KEY_SEP: &str = ":";
/// Wildcard meaning "every key" in bulk operations.
pub const META_ANY: &str = "*any";
/// Placeholder rule type of the catch-all index key.
pub const META_NONE: &str = "*none";
/// Transaction ID for writes applied immediately.
pub const NON_TRANSACTIONAL: &str = "";

/// Join parts with the key separator.
pub fn concatenated_key(parts: &[&str]) -> String {
    parts.join(CONCATENATED_KEY_SEP)
}

macro_rules! cache_ids {
    ($($variant:ident => $name:literal, $prefix:literal;)+) => {
        /// Identifier of a cache partition.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum CacheId {
            $($variant,)+
        }

        impl CacheId {
            /// Every partition, in declaration order.
            pub const ALL: &'static [CacheId] = &[$(CacheId::$variant,)+];

            /// Partition name, e.g. `*filters`.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(CacheId::$variant => $name,)+
                }
            }

            /// Store key prefix, e.g. `ftr_`.
            pub fn prefix(self) -> &'static str {
                match self {
                    $(CacheId::$variant => $prefix,)+
                }
            }
        }
    };
}

cache_ids! {
    Filters => "*filters", "ftr_";
    ResourceProfiles => "*resource_profiles", "rsp_";
    Resources => "*resources", "res_";
    ThresholdProfiles => "*threshold_profiles", "thp_";
    Thresholds => "*thresholds", "thd_";
    StatQueueProfiles => "*statqueue_profiles", "sqp_";
    StatQueues => "*statqueues", "stq_";
    RouteProfiles => "*route_profiles", "rpp_";
    ChargerProfiles => "*charger_profiles", "cpp_";
    DispatcherProfiles => "*dispatcher_profiles", "dpp_";
    DispatcherHosts => "*dispatcher_hosts", "dph_";
    RateProfiles => "*rate_profiles", "rtp_";
    ActionProfiles => "*action_profiles", "acp_";
    Accounts => "*accounts", "acn_";
    ActionPlans => "*action_plans", "apl_";
    AccountActionPlans => "*account_action_plans", "aap_";
    RatingProfiles => "*rating_profiles", "rpf_";
    Destinations => "*destinations", "dst_";
    ResourceFilterIndexes => "*resource_filter_indexes", "rfi_";
    ThresholdFilterIndexes => "*threshold_filter_indexes", "tfi_";
    StatFilterIndexes => "*stat_filter_indexes", "sfi_";
    RouteFilterIndexes => "*route_filter_indexes", "rti_";
    ChargerFilterIndexes => "*charger_filter_indexes", "cci_";
    DispatcherFilterIndexes => "*dispatcher_filter_indexes", "dfi_";
    RateProfileFilterIndexes => "*rate_profile_filter_indexes", "rpi_";
    ActionProfileFilterIndexes => "*action_profile_filter_indexes", "aci_";
    AccountFilterIndexes => "*account_filter_indexes", "ani_";
    ReverseFilterIndexes => "*reverse_filter_indexes", "fii_";
    LoadIds => "*load_ids", "lid_";
}

/// Partitions that must be refreshed together with a given partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Filter index partition holding keys for this entity kind
    pub index: Option<CacheId>,
    /// Runtime partition derived from this profile kind
    pub derived: Option<CacheId>,
}

static PREFIX_TO_CACHE_ID: Lazy<HashMap<&'static str, CacheId>> =
    Lazy::new(|| CacheId::ALL.iter().map(|id| (id.prefix(), *id)).collect());

static NAME_TO_CACHE_ID: Lazy<HashMap<&'static str, CacheId>> =
    Lazy::new(|| CacheId::ALL.iter().map(|id| (id.as_str(), *id)).collect());

impl CacheId {
    /// Static capability lookup.
    pub fn capabilities(self) -> Capabilities {
        use CacheId::*;
        let (index, derived) = match self {
            ResourceProfiles => (Some(ResourceFilterIndexes), Some(Resources)),
            ThresholdProfiles => (Some(ThresholdFilterIndexes), Some(Thresholds)),
            StatQueueProfiles => (Some(StatFilterIndexes), Some(StatQueues)),
            RouteProfiles => (Some(RouteFilterIndexes), None),
            ChargerProfiles => (Some(ChargerFilterIndexes), None),
            DispatcherProfiles => (Some(DispatcherFilterIndexes), None),
            RateProfiles => (Some(RateProfileFilterIndexes), None),
            ActionProfiles => (Some(ActionProfileFilterIndexes), None),
            Accounts => (Some(AccountFilterIndexes), None),
            _ => (None, None),
        };
        Capabilities { index, derived }
    }

    /// Filter index partition for this entity kind, if any.
    pub fn index_partition(self) -> Option<CacheId> {
        self.capabilities().index
    }

    /// Entity partition owning this index partition.
    pub fn index_owner(self) -> Option<CacheId> {
        CacheId::ALL
            .iter()
            .copied()
            .find(|id| id.capabilities().index == Some(self))
    }

    /// True for filter index partitions, reverse index included.
    pub fn is_index(self) -> bool {
        self == CacheId::ReverseFilterIndexes || self.index_owner().is_some()
    }

    /// Resolve a store prefix to its partition.
    pub fn from_prefix(prefix: &str) -> Result<CacheId> {
        PREFIX_TO_CACHE_ID
            .get(prefix)
            .copied()
            .ok_or(Error::UnsupportedCachePrefix)
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NAME_TO_CACHE_ID
            .get(s)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown cache partition: {}", s)))
    }
}

impl Serialize for CacheId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CacheId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
