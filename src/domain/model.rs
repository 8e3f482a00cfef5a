//! Entity kinds handled by the data layer.
//!
//! Every entity is keyed by (tenant, ID). Profiles carry filter IDs and are
//! indexed; runtime entities (resources, thresholds, stat queues) are plain.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::Filter;
use super::partitions::{concatenated_key, CacheId};

/// Typed access to one entity kind.
pub trait Item: Clone + Send + Sync + 'static {
    /// Partition the kind is stored and cached under
    const CACHE_ID: CacheId;

    fn tenant(&self) -> &str;
    fn id(&self) -> &str;

    /// Filters gating this entity; empty for plain entities.
    fn filter_ids(&self) -> &[String];

    fn into_entity(self) -> Entity;
    fn from_entity(entity: Entity) -> Option<Self>;

    fn tenant_id(&self) -> String {
        concatenated_key(&[self.tenant(), self.id()])
    }
}

macro_rules! entities {
    ($($variant:ident => $cache:ident $(, filters: $field:ident)?;)+) => {
        /// Any stored entity, used where the kind is only known at runtime.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "Kind", content = "Data")]
        pub enum Entity {
            $($variant($variant),)+
        }

        impl Entity {
            pub fn cache_id(&self) -> CacheId {
                match self {
                    $(Entity::$variant(_) => CacheId::$cache,)+
                }
            }

            pub fn tenant(&self) -> &str {
                match self {
                    $(Entity::$variant(e) => &e.tenant,)+
                }
            }

            pub fn id(&self) -> &str {
                match self {
                    $(Entity::$variant(e) => &e.id,)+
                }
            }

            pub fn filter_ids(&self) -> &[String] {
                match self {
                    $(Entity::$variant(e) => e.filter_ids(),)+
                }
            }

            pub fn tenant_id(&self) -> String {
                concatenated_key(&[self.tenant(), self.id()])
            }
        }

        $(
            impl Item for $variant {
                const CACHE_ID: CacheId = CacheId::$cache;

                fn tenant(&self) -> &str {
                    &self.tenant
                }

                fn id(&self) -> &str {
                    &self.id
                }

                fn filter_ids(&self) -> &[String] {
                    entities!(@filters self $(, $field)?)
                }

                fn into_entity(self) -> Entity {
                    Entity::$variant(self)
                }

                fn from_entity(entity: Entity) -> Option<Self> {
                    match entity {
                        Entity::$variant(e) => Some(e),
                        _ => None,
                    }
                }
            }

            impl From<$variant> for Entity {
                fn from(e: $variant) -> Self {
                    Entity::$variant(e)
                }
            }
        )+
    };
    (@filters $self:ident, $field:ident) => {
        &$self.$field
    };
    (@filters $self:ident) => {
        &[]
    };
}

entities! {
    Filter => Filters;
    ResourceProfile => ResourceProfiles, filters: filter_ids;
    Resource => Resources;
    ThresholdProfile => ThresholdProfiles, filters: filter_ids;
    Threshold => Thresholds;
    StatQueueProfile => StatQueueProfiles, filters: filter_ids;
    StatQueue => StatQueues;
    RouteProfile => RouteProfiles, filters: filter_ids;
    ChargerProfile => ChargerProfiles, filters: filter_ids;
    DispatcherProfile => DispatcherProfiles, filters: filter_ids;
    DispatcherHost => DispatcherHosts;
    RateProfile => RateProfiles, filters: filter_ids;
    ActionProfile => ActionProfiles, filters: filter_ids;
    Account => Accounts, filters: filter_ids;
    ActionPlan => ActionPlans;
    AccountActionPlans => AccountActionPlans;
    RatingProfile => RatingProfiles;
    Destination => Destinations;
}

// =============================================================================
// Resources
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub usage_ttl: Option<Duration>,
    pub limit: f64,
    pub allocation_message: String,
    pub blocker: bool,
    pub stored: bool,
    pub weight: f64,
    #[serde(rename = "ThresholdIDs", default)]
    pub threshold_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceUsage {
    #[serde(rename = "ID")]
    pub id: String,
    pub expiry_time: Option<DateTime<Utc>>,
    pub units: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub usages: BTreeMap<String, ResourceUsage>,
    #[serde(rename = "TTLIdx", default)]
    pub ttl_idx: Vec<String>,
}

impl Resource {
    /// Units currently allocated.
    pub fn total_usage(&self) -> f64 {
        self.usages.values().map(|u| u.units).sum()
    }
}

// =============================================================================
// Thresholds and stats
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ThresholdProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub max_hits: i64,
    pub min_hits: i64,
    pub min_sleep: Duration,
    pub blocker: bool,
    pub weight: f64,
    #[serde(rename = "ActionProfileIDs", default)]
    pub action_profile_ids: Vec<String>,
    #[serde(rename = "Async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Threshold {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub hits: i64,
    pub snooze: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatQueueProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub queue_length: usize,
    #[serde(rename = "TTL")]
    pub ttl: Option<Duration>,
    pub min_items: usize,
    #[serde(default)]
    pub metrics: Vec<String>,
    pub stored: bool,
    pub blocker: bool,
    pub weight: f64,
    #[serde(rename = "ThresholdIDs", default)]
    pub threshold_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatQueueItem {
    #[serde(rename = "EventID")]
    pub event_id: String,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatQueue {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "SQItems", default)]
    pub sq_items: Vec<StatQueueItem>,
    #[serde(rename = "SQMetrics", default)]
    pub sq_metrics: BTreeMap<String, f64>,
}

// =============================================================================
// Routing, charging, dispatching
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    #[serde(rename = "AccountIDs", default)]
    pub account_ids: Vec<String>,
    #[serde(rename = "RateProfileIDs", default)]
    pub rate_profile_ids: Vec<String>,
    pub weight: f64,
    pub blocker: bool,
    pub route_parameters: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub sorting: String,
    #[serde(default)]
    pub sorting_parameters: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChargerProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    #[serde(rename = "RunID")]
    pub run_id: String,
    #[serde(rename = "AttributeIDs", default)]
    pub attribute_ids: Vec<String>,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatcherHostProfile {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub weight: f64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub blocker: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatcherProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub strategy: String,
    #[serde(default)]
    pub strategy_params: BTreeMap<String, String>,
    pub weight: f64,
    #[serde(default)]
    pub hosts: Vec<DispatcherHostProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatcherHost {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub address: String,
    pub transport: String,
    #[serde(rename = "TLS")]
    pub tls: bool,
    pub connect_attempts: u32,
    pub reconnects: i32,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

// =============================================================================
// Rating, actions, accounts
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IntervalRate {
    pub interval_start: Duration,
    pub fixed_fee: f64,
    pub recurrent_fee: f64,
    pub unit: Duration,
    pub increment: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rate {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub activation_times: String,
    pub weight: f64,
    pub blocker: bool,
    #[serde(default)]
    pub interval_rates: Vec<IntervalRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RateProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub weight: f64,
    pub min_cost: f64,
    pub max_cost: f64,
    pub max_cost_strategy: String,
    #[serde(default)]
    pub rates: BTreeMap<String, Rate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionDef {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    #[serde(rename = "TTL")]
    pub ttl: Duration,
    #[serde(rename = "Type")]
    pub action_type: String,
    #[serde(default)]
    pub opts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub diktats: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionProfile {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub weight: f64,
    pub schedule: String,
    #[serde(default)]
    pub targets: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Balance {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub weight: f64,
    #[serde(rename = "Type")]
    pub balance_type: String,
    pub units: f64,
    #[serde(default)]
    pub opts: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "FilterIDs", default)]
    pub filter_ids: Vec<String>,
    pub weight: f64,
    #[serde(default)]
    pub opts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub balances: BTreeMap<String, Balance>,
    #[serde(rename = "ThresholdIDs", default)]
    pub threshold_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionTiming {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "ActionsID")]
    pub actions_id: String,
    pub timing: String,
    pub weight: f64,
}

/// Scheduled actions and the accounts they apply to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionPlan {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "AccountIDs", default)]
    pub account_ids: BTreeSet<String>,
    #[serde(default)]
    pub action_timings: Vec<ActionTiming>,
}

/// Reverse of [`ActionPlan::account_ids`]: the plans scheduled for an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountActionPlans {
    pub tenant: String,
    /// Account ID
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ActionPlanIDs", default)]
    pub action_plan_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RatingPlanActivation {
    pub activation_time: DateTime<Utc>,
    #[serde(rename = "RatingPlanID")]
    pub rating_plan_id: String,
    #[serde(default)]
    pub fallback_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RatingProfile {
    pub tenant: String,
    /// `*out:<tenant>:<category>:<subject>`
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub rating_plan_activations: Vec<RatingPlanActivation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Destination {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
}
