//! Tenant risk scoring and write enforcement.
//!
//! The composite weighs the publish failure ratio (7 days), the flagged
//! content ratio (30 days), and the rate-limit abuse rate. High-impact
//! writes are refused at the collaborator API boundary when enforcement is
//! on and the stored score crosses the threshold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::OutpostError;
use crate::kv::{Kv, keys};
use crate::store::models::{ContentStatus, RiskLevel, TenantRiskScore};
use crate::store::Store;
use crate::types::TenantId;

const FAILURE_WINDOW_DAYS: i64 = 7;
const FLAGGED_WINDOW_DAYS: i64 = 30;
/// Content with a quality risk score at or above this counts as flagged
/// even when it was not routed to review.
const FLAGGED_RISK_SCORE: f64 = 0.65;

fn flagged_ratio(store: &dyn Store, tenant_id: TenantId, since: DateTime<Utc>) -> f64 {
    let Ok(items) = store.content_items_since(tenant_id, since) else {
        return 0.0;
    };
    if items.is_empty() {
        return 0.0;
    }
    let flagged = items
        .iter()
        .filter(|item| {
            if item.status == ContentStatus::NeedsReview {
                return true;
            }
            item.metadata
                .get("quality")
                .and_then(|q| q.get("risk_score"))
                .and_then(Value::as_f64)
                .map(|score| score >= FLAGGED_RISK_SCORE)
                .unwrap_or(false)
        })
        .count();
    flagged as f64 / items.len() as f64
}

fn rate_limit_violations(kv: &dyn Kv, tenant_id: TenantId) -> u64 {
    kv.get(&keys::tenant_rate_limit_violations(tenant_id))
        .ok()
        .flatten()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Compute and persist the composite risk snapshot for one tenant.
pub fn calculate_tenant_risk(
    store: &dyn Store,
    kv: &dyn Kv,
    tenant_id: TenantId,
    now: DateTime<Utc>,
) -> Result<TenantRiskScore, OutpostError> {
    let publish_failure_ratio = store
        .publish_attempt_stats(
            Some(tenant_id),
            now - chrono::Duration::days(FAILURE_WINDOW_DAYS),
        )?
        .failure_rate();
    let flagged_content_ratio = flagged_ratio(
        store,
        tenant_id,
        now - chrono::Duration::days(FLAGGED_WINDOW_DAYS),
    );
    let violations = rate_limit_violations(kv, tenant_id);
    let abuse_rate = (violations as f64 / 100.0).min(1.0);

    let raw = publish_failure_ratio * 45.0 + flagged_content_ratio * 30.0 + abuse_rate * 25.0;
    let risk_score = (raw.round() as u32).min(100);

    let score = TenantRiskScore {
        tenant_id,
        risk_score,
        publish_failure_ratio,
        flagged_content_ratio,
        abuse_rate,
        rate_limit_violations: violations,
        level: RiskLevel::from_score(risk_score),
        updated_at: now,
    };
    store.upsert_tenant_risk(&score)?;
    Ok(score)
}

/// Gate for schedule/publish-now writes at the API boundary. Returns
/// `RiskBlocked` when enforcement is on and the stored score crosses the
/// threshold; the engine is then never asked to publish.
pub fn enforce_schedule_write(
    store: &dyn Store,
    enforcement_enabled: bool,
    tenant_id: TenantId,
    threshold: u32,
) -> Result<(), OutpostError> {
    if !enforcement_enabled {
        return Ok(());
    }
    let Some(score) = store.tenant_risk(tenant_id)? else {
        return Ok(());
    };
    if score.risk_score >= threshold {
        return Err(OutpostError::RiskBlocked {
            risk_score: score.risk_score,
            threshold,
        });
    }
    Ok(())
}

/// Convenience wrapper for callers holding shared handles.
pub fn calculate_for_all_tenants(
    store: &Arc<dyn Store>,
    kv: &Arc<dyn Kv>,
    now: DateTime<Utc>,
) -> Result<Vec<TenantRiskScore>, OutpostError> {
    let mut scores = Vec::new();
    for tenant_id in store.platform_tenant_ids()? {
        scores.push(calculate_tenant_risk(store.as_ref(), kv.as_ref(), tenant_id, now)?);
    }
    Ok(scores)
}
