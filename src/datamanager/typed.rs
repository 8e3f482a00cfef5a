//! Per-kind accessors.

use tracing::instrument;

use super::DataManager;
use crate::domain::{
    Account, AccountActionPlans, ActionProfile, ChargerProfile, Context, Destination,
    DispatcherHost, DispatcherProfile, Filter, RateProfile, Resource, ResourceProfile,
    RouteProfile, StatQueue, StatQueueProfile, Threshold, ThresholdProfile,
};
use crate::error::Result;
use crate::metrics;

macro_rules! typed_accessors {
    ($($ty:ident => $get:ident, $set:ident, $remove:ident;)+) => {
        impl DataManager {
            $(
                #[doc = concat!("Read a [`", stringify!($ty), "`].")]
                pub async fn $get(
                    &self,
                    ctx: &Context,
                    tenant: &str,
                    id: &str,
                    cache_read: bool,
                    cache_write: bool,
                    txn_id: &str,
                ) -> Result<$ty> {
                    self.get_item::<$ty>(ctx, tenant, id, cache_read, cache_write, txn_id)
                        .await
                }

                #[doc = concat!("Store a [`", stringify!($ty), "`].")]
                pub async fn $set(&self, ctx: &Context, item: $ty, with_index: bool) -> Result<()> {
                    self.set_item(ctx, item, with_index).await
                }

                #[doc = concat!("Remove a [`", stringify!($ty), "`].")]
                pub async fn $remove(
                    &self,
                    ctx: &Context,
                    tenant: &str,
                    id: &str,
                    with_index: bool,
                ) -> Result<()> {
                    self.remove_item::<$ty>(ctx, tenant, id, with_index).await
                }
            )+
        }
    };
}

typed_accessors! {
    ResourceProfile => get_resource_profile, set_resource_profile, remove_resource_profile;
    Resource => get_resource, set_resource, remove_resource;
    ThresholdProfile => get_threshold_profile, set_threshold_profile, remove_threshold_profile;
    Threshold => get_threshold, set_threshold, remove_threshold;
    StatQueueProfile => get_statqueue_profile, set_statqueue_profile, remove_statqueue_profile;
    StatQueue => get_statqueue, set_statqueue, remove_statqueue;
    RouteProfile => get_route_profile, set_route_profile, remove_route_profile;
    ChargerProfile => get_charger_profile, set_charger_profile, remove_charger_profile;
    DispatcherProfile => get_dispatcher_profile, set_dispatcher_profile, remove_dispatcher_profile;
    DispatcherHost => get_dispatcher_host, set_dispatcher_host, remove_dispatcher_host;
    RateProfile => get_rate_profile, set_rate_profile, remove_rate_profile;
    ActionProfile => get_action_profile, set_action_profile, remove_action_profile;
    Account => get_account, set_account, remove_account;
    AccountActionPlans => get_account_action_plans, set_account_action_plans, remove_account_action_plans;
    Destination => get_destination, set_destination, remove_destination;
}

impl DataManager {
    /// Read a filter. Inline IDs are parsed on the spot and never stored.
    pub async fn get_filter(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
        txn_id: &str,
    ) -> Result<Filter> {
        if Filter::is_inline(id) {
            return Filter::from_inline(tenant, id);
        }
        self.get_item::<Filter>(ctx, tenant, id, cache_read, cache_write, txn_id)
            .await
    }

    /// Store a filter; with `with_index` every entity referencing it is
    /// re-indexed against the new rules.
    pub async fn set_filter(&self, ctx: &Context, filter: Filter, with_index: bool) -> Result<()> {
        self.set_item(ctx, filter, with_index).await
    }

    /// Remove a filter. A filter still referenced by indexed entities is
    /// refused with `Error::FilterReferenced` unless `force` is set, in which
    /// case the dependents are re-indexed without it.
    #[instrument(skip(self, ctx))]
    pub async fn remove_filter(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        with_index: bool,
        force: bool,
    ) -> Result<()> {
        let res = self
            .remove_entity_inner(ctx, crate::domain::CacheId::Filters, tenant, id, with_index, force)
            .await;
        metrics::record_op("remove", crate::domain::CacheId::Filters.as_str(), &res);
        res
    }
}
