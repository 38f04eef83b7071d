//! Billing collaborator view.
//!
//! The engine never computes billing; it consults the subscription and
//! usage rows maintained by the Stripe collaborator, enforces the plan's
//! post quota at write paths, and runs the monthly usage reset beat.

use chrono::{DateTime, Utc};

use crate::error::OutpostError;
use crate::store::models::{CompanySubscription, CompanyUsage};
use crate::store::Store;
use crate::types::TenantId;

/// Read-only billing snapshot for one tenant.
#[derive(Debug, Clone)]
pub struct BillingState {
    pub subscription: Option<CompanySubscription>,
    pub usage: Option<CompanyUsage>,
}

impl BillingState {
    pub fn posts_used(&self) -> u64 {
        self.usage
            .as_ref()
            .map(|u| u.posts_used_current_period)
            .unwrap_or(0)
    }

    pub fn post_limit(&self) -> Option<u64> {
        self.subscription.as_ref().map(|s| s.max_posts_per_month)
    }

    /// Whether the subscription has lapsed past its grace window.
    pub fn lapsed(&self, now: DateTime<Utc>) -> bool {
        let Some(subscription) = &self.subscription else {
            return false;
        };
        if subscription.status == "active" {
            return false;
        }
        match subscription.grace_period_ends_at {
            Some(grace_end) => now > grace_end,
            None => true,
        }
    }
}

pub fn billing_state(store: &dyn Store, tenant_id: TenantId) -> Result<BillingState, OutpostError> {
    Ok(BillingState {
        subscription: store.company_subscription(tenant_id)?,
        usage: store.company_usage(tenant_id)?,
    })
}

/// Plan-limit gate for post-creating writes. Tenants without a subscription
/// row are not limited here (free tier enforcement lives with the billing
/// collaborator).
pub fn check_post_quota(
    store: &dyn Store,
    tenant_id: TenantId,
    now: DateTime<Utc>,
) -> Result<(), OutpostError> {
    let state = billing_state(store, tenant_id)?;
    let Some(limit) = state.post_limit() else {
        return Ok(());
    };
    if state.lapsed(now) {
        return Err(OutpostError::PlanLimitExceeded {
            used: state.posts_used(),
            limit,
        });
    }
    let used = state.posts_used();
    if used >= limit {
        return Err(OutpostError::PlanLimitExceeded { used, limit });
    }
    Ok(())
}

/// Count one post against the tenant's current period.
pub fn record_post_usage(
    store: &dyn Store,
    tenant_id: TenantId,
    now: DateTime<Utc>,
) -> Result<u64, OutpostError> {
    Ok(store.increment_posts_used(tenant_id, now)?)
}

/// Monthly reset beat.
pub fn reset_usage_for_new_period(
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<u64, OutpostError> {
    Ok(store.platform_reset_usage(now)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn subscription(tenant_id: TenantId, max_posts: u64, status: &str) -> CompanySubscription {
        CompanySubscription {
            tenant_id,
            plan: "Growth".into(),
            max_posts_per_month: max_posts,
            status: status.into(),
            grace_period_ends_at: None,
            updated_at: now(),
        }
    }

    #[test]
    fn test_quota_enforced_at_limit() {
        let store = MemoryStore::new();
        let tenant_id = TenantId::new();
        store
            .upsert_company_subscription(&subscription(tenant_id, 2, "active"))
            .unwrap();

        assert!(check_post_quota(&store, tenant_id, now()).is_ok());
        record_post_usage(&store, tenant_id, now()).unwrap();
        assert!(check_post_quota(&store, tenant_id, now()).is_ok());
        record_post_usage(&store, tenant_id, now()).unwrap();

        let err = check_post_quota(&store, tenant_id, now()).unwrap_err();
        assert!(matches!(err, OutpostError::PlanLimitExceeded { used: 2, limit: 2 }));
    }

    #[test]
    fn test_no_subscription_is_not_limited_here() {
        let store = MemoryStore::new();
        assert!(check_post_quota(&store, TenantId::new(), now()).is_ok());
    }

    #[test]
    fn test_lapsed_subscription_blocks_after_grace() {
        let store = MemoryStore::new();
        let tenant_id = TenantId::new();
        let mut lapsed = subscription(tenant_id, 100, "past_due");
        lapsed.grace_period_ends_at = Some(now() - chrono::Duration::days(1));
        store.upsert_company_subscription(&lapsed).unwrap();

        assert!(check_post_quota(&store, tenant_id, now()).is_err());

        // Inside the grace window writes still pass.
        let mut in_grace = subscription(tenant_id, 100, "past_due");
        in_grace.grace_period_ends_at = Some(now() + chrono::Duration::days(3));
        store.upsert_company_subscription(&in_grace).unwrap();
        assert!(check_post_quota(&store, tenant_id, now()).is_ok());
    }

    #[test]
    fn test_monthly_reset() {
        let store = MemoryStore::new();
        let tenant_id = TenantId::new();
        store
            .upsert_company_subscription(&subscription(tenant_id, 10, "active"))
            .unwrap();
        record_post_usage(&store, tenant_id, now()).unwrap();
        record_post_usage(&store, tenant_id, now()).unwrap();
        assert_eq!(billing_state(&store, tenant_id).unwrap().posts_used(), 2);

        let reset = reset_usage_for_new_period(&store, now()).unwrap();
        assert_eq!(reset, 1);
        assert_eq!(billing_state(&store, tenant_id).unwrap().posts_used(), 0);
    }
}
