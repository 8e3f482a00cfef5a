//! Action plans and rating profiles.
//!
//! These are rewritten as a whole by concurrent callers (account sets are
//! merged, activations replaced), so every read-modify-write runs under a
//! guardian lock named after the entity. Action plans also keep the
//! per-account reverse map in `*account_action_plans` in step.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument};

use super::DataManager;
use crate::domain::{
    concatenated_key, AccountActionPlans, ActionPlan, CacheId, Context, RatingProfile,
    NON_TRANSACTIONAL,
};
use crate::error::{Error, Result};
use crate::guardian::lock_key;

impl DataManager {
    fn plan_lock(&self, tenant: &str, id: &str) -> String {
        lock_key(CacheId::ActionPlans.prefix(), &concatenated_key(&[tenant, id]))
    }

    pub async fn get_action_plan(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
        txn_id: &str,
    ) -> Result<ActionPlan> {
        self.get_item(ctx, tenant, id, cache_read, cache_write, txn_id)
            .await
    }

    /// Store an action plan.
    ///
    /// `ID` and `ActionTimings` are mandatory. An existing plan is only
    /// replaced when `overwrite` is set; otherwise the call fails with
    /// `Error::Exists`. Accounts dropped from or added to the plan have their
    /// account action plans updated.
    #[instrument(skip(self, ctx, plan), fields(id = %plan.id))]
    pub async fn set_action_plan(&self, ctx: &Context, mut plan: ActionPlan, overwrite: bool) -> Result<()> {
        let mut missing = Vec::new();
        if plan.id.is_empty() {
            missing.push("ID");
        }
        if plan.action_timings.is_empty() {
            missing.push("ActionTimings");
        }
        if !missing.is_empty() {
            return Err(Error::mandatory(missing));
        }
        plan.tenant = self.resolve_tenant(ctx, &plan.tenant);
        let tenant = plan.tenant.clone();
        let id = plan.id.clone();

        self.guardian
            .guard(&[self.plan_lock(&tenant, &id)], None, || async {
                let prev = match self
                    .get_action_plan(ctx, &tenant, &id, false, false, NON_TRANSACTIONAL)
                    .await
                {
                    Ok(prev) => Some(prev),
                    Err(Error::NotFound) => None,
                    Err(e) => return Err(e),
                };
                if prev.is_some() && !overwrite {
                    return Err(Error::Exists);
                }
                let prev_accounts = prev.map(|p| p.account_ids).unwrap_or_default();
                let next_accounts = plan.account_ids.clone();
                self.set_item(ctx, plan, false).await?;
                self.sync_account_action_plans(ctx, &tenant, &id, &prev_accounts, &next_accounts)
                    .await?;
                info!(tenant = %tenant, id = %id, accounts = next_accounts.len(), "action plan stored");
                Ok(())
            })
            .await
    }

    /// Merge accounts into an existing plan and return the updated plan.
    #[instrument(skip(self, ctx, account_ids))]
    pub async fn add_accounts_to_action_plan(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        account_ids: &[String],
    ) -> Result<ActionPlan> {
        let tenant = self.resolve_tenant(ctx, tenant);
        self.guardian
            .guard(&[self.plan_lock(&tenant, id)], None, || async {
                let mut plan = self
                    .get_action_plan(ctx, &tenant, id, false, false, NON_TRANSACTIONAL)
                    .await?;
                let prev = plan.account_ids.clone();
                plan.account_ids.extend(account_ids.iter().cloned());
                if plan.account_ids == prev {
                    return Ok(plan);
                }
                self.set_item(ctx, plan.clone(), false).await?;
                self.sync_account_action_plans(ctx, &tenant, id, &prev, &plan.account_ids)
                    .await?;
                Ok(plan)
            })
            .await
    }

    /// Remove a plan and detach it from its accounts.
    #[instrument(skip(self, ctx))]
    pub async fn remove_action_plan(&self, ctx: &Context, tenant: &str, id: &str) -> Result<()> {
        let tenant = self.resolve_tenant(ctx, tenant);
        self.guardian
            .guard(&[self.plan_lock(&tenant, id)], None, || async {
                let plan = self
                    .get_action_plan(ctx, &tenant, id, false, false, NON_TRANSACTIONAL)
                    .await?;
                self.remove_item::<ActionPlan>(ctx, &tenant, id, false).await?;
                self.sync_account_action_plans(ctx, &tenant, id, &plan.account_ids, &BTreeSet::new())
                    .await
            })
            .await
    }

    /// Bring `*account_action_plans` in line with a plan's account change.
    async fn sync_account_action_plans(
        &self,
        ctx: &Context,
        tenant: &str,
        plan_id: &str,
        prev: &BTreeSet<String>,
        next: &BTreeSet<String>,
    ) -> Result<()> {
        for account in prev.difference(next) {
            self.update_account_plans(ctx, tenant, account, plan_id, false)
                .await?;
        }
        for account in next.difference(prev) {
            self.update_account_plans(ctx, tenant, account, plan_id, true)
                .await?;
        }
        Ok(())
    }

    async fn update_account_plans(
        &self,
        ctx: &Context,
        tenant: &str,
        account: &str,
        plan_id: &str,
        attach: bool,
    ) -> Result<()> {
        let lock = lock_key(
            CacheId::AccountActionPlans.prefix(),
            &concatenated_key(&[tenant, account]),
        );
        self.guardian
            .guard(&[lock], None, || async {
                let mut aap = match self
                    .get_item::<AccountActionPlans>(ctx, tenant, account, false, false, NON_TRANSACTIONAL)
                    .await
                {
                    Ok(aap) => aap,
                    Err(Error::NotFound) if attach => AccountActionPlans {
                        tenant: tenant.to_string(),
                        id: account.to_string(),
                        ..AccountActionPlans::default()
                    },
                    Err(Error::NotFound) => return Ok(()),
                    Err(e) => return Err(e),
                };
                let changed = if attach {
                    aap.action_plan_ids.insert(plan_id.to_string())
                } else {
                    aap.action_plan_ids.remove(plan_id)
                };
                if !changed {
                    return Ok(());
                }
                debug!(tenant, account, plan_id, attach, "account action plans updated");
                if aap.action_plan_ids.is_empty() {
                    self.remove_item::<AccountActionPlans>(ctx, tenant, account, false)
                        .await
                } else {
                    self.set_item(ctx, aap, false).await
                }
            })
            .await
    }

    // =========================================================================
    // Rating profiles
    // =========================================================================

    fn rating_lock(&self, tenant: &str, id: &str) -> String {
        lock_key(CacheId::RatingProfiles.prefix(), &concatenated_key(&[tenant, id]))
    }

    pub async fn get_rating_profile(
        &self,
        ctx: &Context,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
        txn_id: &str,
    ) -> Result<RatingProfile> {
        self.get_item(ctx, tenant, id, cache_read, cache_write, txn_id)
            .await
    }

    #[instrument(skip(self, ctx, profile), fields(id = %profile.id))]
    pub async fn set_rating_profile(&self, ctx: &Context, mut profile: RatingProfile) -> Result<()> {
        profile.tenant = self.resolve_tenant(ctx, &profile.tenant);
        let lock = self.rating_lock(&profile.tenant, &profile.id);
        self.guardian
            .guard(&[lock], None, || self.set_item(ctx, profile, false))
            .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn remove_rating_profile(&self, ctx: &Context, tenant: &str, id: &str) -> Result<()> {
        let tenant = self.resolve_tenant(ctx, tenant);
        self.guardian
            .guard(&[self.rating_lock(&tenant, id)], None, || {
                self.remove_item::<RatingProfile>(ctx, &tenant, id, false)
            })
            .await
    }
}
