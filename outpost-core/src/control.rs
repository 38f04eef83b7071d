//! Control plane — feature flags, publish circuit breakers, maintenance
//! mode, system health scoring, auto-recovery, and performance baselines.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::{ControlConfig, RiskConfig};
use crate::error::OutpostError;
use crate::kv::{Kv, keys};
use crate::queue::{QUEUE_ANALYTICS, QUEUE_PUBLISHING, QUEUE_SCHEDULER};
use crate::scheduler::Heartbeat;
use crate::store::models::{
    AuditLogEntry, ChannelStatus, FeatureFlag, IncidentSeverity, IncidentStatus, PerformanceBaseline,
    PlatformIncident, SystemHealthComponent,
};
use crate::store::Store;
use crate::types::{EventId, IncidentId, TenantId};

/// Flags the engine consults, seeded on startup when missing.
pub const FLAG_KEYS: &[(&str, &str)] = &[
    ("beta_ai_quality", "AI quality and safety enforcement"),
    (
        "auto_disable_connector_on_repeated_failures",
        "Auto-recovery disables unstable connectors",
    ),
    (
        "auto_throttle_tenant_on_high_error_rate",
        "Auto-recovery throttles tenants with high error rates",
    ),
    (
        "enable_global_publish_circuit_breaker",
        "Global publish pause during incidents",
    ),
    (
        "enable_tenant_publish_circuit_breaker",
        "Tenant-level publish pause during incidents",
    ),
    ("maintenance_read_only_mode", "Global read-only maintenance mode"),
    (
        "enforce_tenant_risk_controls",
        "Require manual approval when tenant risk is high",
    ),
];

/// Feature flag reads with a short-TTL KV cache. Cache misses and KV
/// failures fall back to the store; flag checks never hard-fail.
pub struct FeatureFlags {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
    cache_ttl: Duration,
}

impl FeatureFlags {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn Kv>, cache_ttl: Duration) -> Self {
        Self {
            store,
            kv,
            cache_ttl,
        }
    }

    /// Seed the known flag set, disabled, where rows are missing.
    pub fn bootstrap(&self, now: DateTime<Utc>) -> Result<(), OutpostError> {
        let existing: std::collections::BTreeSet<String> = self
            .store
            .list_feature_flags()?
            .into_iter()
            .map(|f| f.key)
            .collect();
        for (key, description) in FLAG_KEYS {
            if existing.contains(*key) {
                continue;
            }
            self.store.upsert_feature_flag(&FeatureFlag {
                key: (*key).to_string(),
                enabled_globally: false,
                enabled_per_tenant: Default::default(),
                description: (*description).to_string(),
                updated_at: now,
            })?;
        }
        self.invalidate();
        Ok(())
    }

    fn cached_rows(&self) -> Option<Vec<FeatureFlag>> {
        let raw = self.kv.get(&keys::feature_flag_cache(None)).ok()??;
        serde_json::from_str(&raw).ok()
    }

    fn load_rows(&self) -> Vec<FeatureFlag> {
        if let Some(rows) = self.cached_rows() {
            return rows;
        }
        let rows = self.store.list_feature_flags().unwrap_or_default();
        if let Ok(serialized) = serde_json::to_string(&rows) {
            let _ = self
                .kv
                .set_ex(&keys::feature_flag_cache(None), &serialized, self.cache_ttl);
        }
        rows
    }

    pub fn list(&self) -> Vec<FeatureFlag> {
        self.load_rows()
    }

    /// Effective state: enabled globally OR for the given tenant.
    pub fn is_enabled(&self, key: &str, tenant_id: Option<TenantId>) -> bool {
        self.load_rows()
            .iter()
            .find(|flag| flag.key == key)
            .map(|flag| flag.effective_for(tenant_id))
            .unwrap_or(false)
    }

    /// Write a flag and drop every cached copy.
    pub fn update(&self, flag: &FeatureFlag) -> Result<(), OutpostError> {
        self.store.upsert_feature_flag(flag)?;
        self.invalidate();
        Ok(())
    }

    pub fn invalidate(&self) {
        let _ = self.kv.delete_prefix(keys::FEATURE_FLAG_CACHE_PREFIX);
    }

    /// Maintenance read-only mode gate for write surfaces.
    pub fn ensure_writable(&self) -> Result<(), OutpostError> {
        if self.is_enabled("maintenance_read_only_mode", None) {
            return Err(OutpostError::MaintenanceMode);
        }
        Ok(())
    }
}

/// Global and per-tenant publish breakers, stored as KV flags.
pub struct Breakers {
    kv: Arc<dyn Kv>,
}

const TENANT_BREAKER_TTL: Duration = Duration::from_secs(1800);
const BREAKER_REASON_TTL: Duration = Duration::from_secs(3600);

impl Breakers {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub fn set_global(&self, enabled: bool, reason: &str) {
        let _ = self
            .kv
            .set(keys::GLOBAL_PUBLISH_BREAKER, if enabled { "1" } else { "0" });
        let _ = self
            .kv
            .set_ex(&keys::global_breaker_reason(), reason, BREAKER_REASON_TTL);
    }

    pub fn global_paused(&self) -> (bool, Option<String>) {
        let paused = self
            .kv
            .get(keys::GLOBAL_PUBLISH_BREAKER)
            .ok()
            .flatten()
            .map(|v| v == "1")
            .unwrap_or(false);
        let reason = if paused {
            self.kv.get(&keys::global_breaker_reason()).ok().flatten()
        } else {
            None
        };
        (paused, reason)
    }

    pub fn set_tenant(&self, tenant_id: TenantId, enabled: bool, reason: &str) {
        let key = keys::tenant_breaker(tenant_id);
        let reason_key = keys::tenant_breaker_reason(tenant_id);
        if enabled {
            let _ = self.kv.set_ex(&key, "1", TENANT_BREAKER_TTL);
            let _ = self.kv.set_ex(&reason_key, reason, TENANT_BREAKER_TTL);
        } else {
            let _ = self.kv.delete(&key);
            let _ = self.kv.delete(&reason_key);
        }
    }

    pub fn tenant_paused(&self, tenant_id: TenantId) -> (bool, Option<String>) {
        let paused = self
            .kv
            .get(&keys::tenant_breaker(tenant_id))
            .ok()
            .flatten()
            .map(|v| v == "1")
            .unwrap_or(false);
        let reason = if paused {
            self.kv
                .get(&keys::tenant_breaker_reason(tenant_id))
                .ok()
                .flatten()
        } else {
            None
        };
        (paused, reason)
    }
}

/// Connector health snapshot: delivery ratios + token validity.
#[derive(Debug, Clone)]
pub struct ConnectorHealth {
    pub channel_id: crate::types::ChannelId,
    pub connector_type: crate::types::ChannelKind,
    pub score: u32,
    pub success_ratio: f64,
    pub failure_ratio: f64,
    pub rate_limit_ratio: f64,
    pub token_status: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cooldown_seconds: u64,
    pub backoff_seconds: u64,
}

/// One computed health snapshot.
#[derive(Debug, Clone)]
pub struct SystemHealthScore {
    pub score: u32,
    pub components: Vec<SystemHealthComponent>,
    pub publish_failure_rate: f64,
    pub store_latency_ms: f64,
    pub kv_latency_ms: f64,
    pub worker_backlog_size: u64,
    pub request_latency_ms: f64,
}

fn status_for_threshold(value: f64, warning: f64, critical: f64) -> &'static str {
    if value >= critical {
        "critical"
    } else if value >= warning {
        "warning"
    } else {
        "ok"
    }
}

/// Control-plane operations bound to shared handles.
pub struct ControlPlane {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
    pub flags: FeatureFlags,
    pub breakers: Breakers,
    control: ControlConfig,
    risk: RiskConfig,
}

const AUTO_THROTTLE_TTL: Duration = Duration::from_secs(15 * 60);
const AUTO_DISABLE_FAILURE_THRESHOLD: u64 = 5;

impl ControlPlane {
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        control: ControlConfig,
        risk: RiskConfig,
    ) -> Self {
        let flags = FeatureFlags::new(
            store.clone(),
            kv.clone(),
            Duration::from_secs(control.flag_cache_ttl_secs.max(10)),
        );
        let breakers = Breakers::new(kv.clone());
        Self {
            store,
            kv,
            flags,
            breakers,
            control,
            risk,
        }
    }

    fn queue_backlog(&self) -> u64 {
        [QUEUE_PUBLISHING, QUEUE_SCHEDULER, QUEUE_ANALYTICS]
            .iter()
            .filter_map(|queue| {
                self.kv
                    .get(&keys::queue_depth(queue))
                    .ok()
                    .flatten()
                    .and_then(|raw| raw.parse::<u64>().ok())
            })
            .sum()
    }

    fn store_latency_ms(&self) -> f64 {
        let started = std::time::Instant::now();
        let _ = self.store.ping();
        started.elapsed().as_secs_f64() * 1000.0
    }

    fn kv_latency_ms(&self) -> f64 {
        let started = std::time::Instant::now();
        let _ = self.kv.get("platform:health:probe");
        started.elapsed().as_secs_f64() * 1000.0
    }

    fn request_latency_ms(&self) -> f64 {
        self.kv
            .get("platform:perf:request_latency_ms:avg")
            .ok()
            .flatten()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0.0)
    }

    /// Compute the health snapshot and persist the component rows.
    pub fn system_health(&self, now: DateTime<Utc>) -> Result<SystemHealthScore, OutpostError> {
        let publish_failure_rate = self
            .store
            .publish_attempt_stats(None, now - chrono::Duration::minutes(60))?
            .failure_rate();
        let store_latency_ms = self.store_latency_ms();
        let kv_latency_ms = self.kv_latency_ms();
        let worker_backlog_size = self.queue_backlog();
        let request_latency_ms = self.request_latency_ms();

        let alert = self.control.publish_failure_alert_threshold * 100.0;
        let components = [
            (
                "publishing",
                status_for_threshold(publish_failure_rate * 100.0, alert, alert * 2.0),
                0.0,
                publish_failure_rate,
            ),
            (
                "database",
                status_for_threshold(
                    store_latency_ms,
                    self.control.db_latency_alert_ms,
                    self.control.db_latency_alert_ms * 2.0,
                ),
                store_latency_ms,
                0.0,
            ),
            (
                "kv",
                status_for_threshold(kv_latency_ms, 40.0, 100.0),
                kv_latency_ms,
                0.0,
            ),
            (
                "worker_backlog",
                status_for_threshold(
                    worker_backlog_size as f64,
                    self.control.worker_backlog_alert_threshold as f64,
                    self.control.worker_backlog_alert_threshold as f64 * 3.0,
                ),
                0.0,
                0.0,
            ),
            (
                "api_requests",
                status_for_threshold(request_latency_ms, 250.0, 700.0),
                request_latency_ms,
                0.0,
            ),
        ];
        for (component, status, latency_ms, error_rate) in components {
            self.store.upsert_system_health(&SystemHealthComponent {
                component: component.to_string(),
                status: status.to_string(),
                latency_ms,
                error_rate,
                updated_at: now,
            })?;
        }

        let penalties = [
            (publish_failure_rate * 400.0).min(35.0),
            ((store_latency_ms - 80.0).max(0.0) / 8.0).min(25.0),
            ((kv_latency_ms - 20.0).max(0.0) / 5.0).min(15.0),
            (worker_backlog_size as f64 / 20.0).min(15.0),
            ((request_latency_ms - 120.0).max(0.0) / 20.0).min(10.0),
        ];
        let score = (100.0 - penalties.iter().sum::<f64>()).clamp(0.0, 100.0) as u32;

        Ok(SystemHealthScore {
            score,
            components: self.store.system_health_components()?,
            publish_failure_rate,
            store_latency_ms,
            kv_latency_ms,
            worker_backlog_size,
            request_latency_ms,
        })
    }

    /// Trip the global breaker when the rolling failure rate crosses the
    /// alert threshold and the flag allows automatic pausing.
    pub fn evaluate_platform_guardrails(
        &self,
        health: &SystemHealthScore,
        now: DateTime<Utc>,
    ) -> Result<Vec<Value>, OutpostError> {
        let mut actions = Vec::new();
        if health.publish_failure_rate > self.control.publish_failure_alert_threshold
            && self
                .flags
                .is_enabled("enable_global_publish_circuit_breaker", None)
        {
            self.breakers.set_global(
                true,
                "Automatic global pause due to elevated publish failures",
            );
            self.store.insert_incident(&PlatformIncident {
                id: IncidentId::new(),
                tenant_id: None,
                incident_type: "global_publish_breaker_enabled".to_string(),
                severity: IncidentSeverity::Critical,
                status: IncidentStatus::Open,
                message: "Publishing paused globally due to elevated failure rate".to_string(),
                metadata: json!({
                    "publish_failure_rate": (health.publish_failure_rate * 10_000.0).round() / 10_000.0
                }),
                created_at: now,
                resolved_at: None,
            })?;
            warn!(
                rate = health.publish_failure_rate,
                "global publish breaker enabled automatically"
            );
            actions.push(json!({ "action": "global_breaker_enabled" }));
        }
        Ok(actions)
    }

    /// Periodic auto-recovery pass: missing heartbeat incidents, connector
    /// auto-disable, tenant throttling + breaker.
    pub fn auto_recovery(
        &self,
        heartbeat: &Heartbeat,
        now: DateTime<Utc>,
    ) -> Result<Vec<Value>, OutpostError> {
        let mut actions = Vec::new();

        if !heartbeat.is_alive() {
            let incident = PlatformIncident {
                id: IncidentId::new(),
                tenant_id: None,
                incident_type: "worker_heartbeat_missing".to_string(),
                severity: IncidentSeverity::Critical,
                status: IncidentStatus::Open,
                message: "Worker heartbeat key is missing; automatic restart requested"
                    .to_string(),
                metadata: json!({}),
                created_at: now,
                resolved_at: None,
            };
            self.store.insert_incident(&incident)?;
            actions.push(json!({
                "action": "worker_restart_event",
                "incident_id": incident.id.to_string(),
            }));
        }

        if self
            .flags
            .is_enabled("auto_disable_connector_on_repeated_failures", None)
        {
            let failing = self.store.platform_channels_with_failures(
                now - chrono::Duration::hours(1),
                AUTO_DISABLE_FAILURE_THRESHOLD,
            )?;
            for (tenant_id, channel_id, failures) in failing {
                let Some(channel) = self.store.channel(tenant_id, channel_id)? else {
                    continue;
                };
                if channel.status == ChannelStatus::Disabled {
                    continue;
                }
                self.store
                    .set_channel_status(tenant_id, channel_id, ChannelStatus::Disabled, now)?;
                self.store.append_audit(&AuditLogEntry {
                    id: EventId::new(),
                    tenant_id: Some(tenant_id),
                    action: "auto_recovery.connector_disabled".to_string(),
                    metadata: json!({ "channel_id": channel_id.to_string(), "failures": failures }),
                    created_at: now,
                })?;
                self.store.insert_incident(&PlatformIncident {
                    id: IncidentId::new(),
                    tenant_id: Some(tenant_id),
                    incident_type: "connector_disabled_repeated_failures".to_string(),
                    severity: IncidentSeverity::Warning,
                    status: IncidentStatus::Open,
                    message: format!("Channel {channel_id} disabled after repeated failures"),
                    metadata: json!({ "failures": failures }),
                    created_at: now,
                    resolved_at: None,
                })?;
                info!(%tenant_id, %channel_id, failures, "connector auto-disabled");
                actions.push(json!({
                    "action": "connector_disabled",
                    "channel_id": channel_id.to_string(),
                }));
            }
        }

        if self
            .flags
            .is_enabled("auto_throttle_tenant_on_high_error_rate", None)
        {
            let threshold = self.risk.manual_approval_threshold;
            for tenant_id in self.store.platform_tenant_ids()? {
                let score = crate::risk::calculate_tenant_risk(
                    self.store.as_ref(),
                    self.kv.as_ref(),
                    tenant_id,
                    now,
                )?;
                if score.risk_score < threshold {
                    continue;
                }
                let _ = self
                    .kv
                    .set_ex(&keys::tenant_throttle(tenant_id), "1", AUTO_THROTTLE_TTL);
                self.store.append_audit(&AuditLogEntry {
                    id: EventId::new(),
                    tenant_id: Some(tenant_id),
                    action: "auto_recovery.tenant_throttled".to_string(),
                    metadata: json!({
                        "risk_score": score.risk_score,
                        "ttl_seconds": AUTO_THROTTLE_TTL.as_secs(),
                    }),
                    created_at: now,
                })?;
                actions.push(json!({
                    "action": "tenant_throttled",
                    "tenant_id": tenant_id.to_string(),
                }));
                if self
                    .flags
                    .is_enabled("enable_tenant_publish_circuit_breaker", Some(tenant_id))
                {
                    self.breakers.set_tenant(
                        tenant_id,
                        true,
                        "Automatic tenant publish breaker enabled by risk controls",
                    );
                    actions.push(json!({
                        "action": "tenant_publish_breaker_enabled",
                        "tenant_id": tenant_id.to_string(),
                    }));
                }
            }
        }

        Ok(actions)
    }

    /// Record one baseline row for a metric from raw samples.
    pub fn record_performance_baseline(
        &self,
        component: &str,
        metric_name: &str,
        samples: &[f64],
        now: DateTime<Utc>,
    ) -> Result<(), OutpostError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95_index = ((sorted.len() as f64 * 0.95) as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        let avg_value = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let p95_value = sorted[p95_index];

        let recent = self.store.recent_baselines(component, metric_name, 5)?;
        let previous_avg = if recent.is_empty() {
            avg_value
        } else {
            recent.iter().map(|b| b.avg_value).sum::<f64>() / recent.len() as f64
        };
        let regression_detected = previous_avg > 0.0 && avg_value > previous_avg * 1.25;

        self.store.insert_performance_baseline(&PerformanceBaseline {
            id: EventId::new(),
            component: component.to_string(),
            metric_name: metric_name.to_string(),
            avg_value,
            p95_value,
            sample_size: samples.len(),
            regression_detected,
            recorded_at: now,
        })?;
        Ok(())
    }

    fn kv_samples(&self, metric_name: &str) -> Vec<f64> {
        self.kv
            .list_range(&keys::perf_samples(metric_name), 500)
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect()
    }

    /// Baseline collection beat: publish latencies from the event log and
    /// the KV sample lists for the other components.
    pub fn collect_performance_baselines(&self, now: DateTime<Utc>) -> Result<(), OutpostError> {
        let publish_samples = self
            .store
            .platform_publish_duration_samples(now - chrono::Duration::hours(4), 1000)?;
        self.record_performance_baseline(
            "publishing",
            "average_publish_latency_ms",
            &publish_samples,
            now,
        )?;
        self.record_performance_baseline(
            "scheduler",
            "scheduler_scan_duration_ms",
            &self.kv_samples("scheduler_scan_duration_ms"),
            now,
        )?;
        self.record_performance_baseline(
            "analytics",
            "analytics_query_duration_ms",
            &self.kv_samples("analytics_query_duration_ms"),
            now,
        )?;
        Ok(())
    }

    /// Score one connector 0-100 from its recent delivery outcomes and
    /// token state.
    pub fn connector_health(
        &self,
        tenant_id: TenantId,
        channel_id: crate::types::ChannelId,
        now: DateTime<Utc>,
    ) -> Result<Option<ConnectorHealth>, OutpostError> {
        let Some(channel) = self.store.channel(tenant_id, channel_id)? else {
            return Ok(None);
        };
        let credential = self.store.connector_credential(tenant_id, channel.kind)?;

        let events = self.store.channel_attempt_events(
            tenant_id,
            channel_id,
            now - chrono::Duration::days(7),
            500,
        )?;
        let total = events.len();
        let success = events
            .iter()
            .filter(|e| e.status == crate::store::models::EventStatus::Ok)
            .count();
        let failed = total - success;
        let rate_limited = events
            .iter()
            .filter(|e| {
                e.metadata
                    .get("normalized_error")
                    .and_then(|n| n.get("category"))
                    .and_then(Value::as_str)
                    == Some("rate_limit")
            })
            .count();
        let success_ratio = if total > 0 {
            success as f64 / total as f64
        } else {
            1.0
        };
        let failure_ratio = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };
        let rate_limit_ratio = if total > 0 {
            rate_limited as f64 / total as f64
        } else {
            0.0
        };

        let token_ok = credential
            .as_ref()
            .map(|c| c.status == crate::store::models::CredentialStatus::Active)
            .unwrap_or(false);
        let token_valid_factor = if token_ok { 1.0 } else { 0.4 };
        let score = (success_ratio * 65.0 + (1.0 - rate_limit_ratio) * 20.0
            + token_valid_factor * 15.0)
            .clamp(0.0, 100.0) as u32;

        let cooldown_seconds = self
            .kv
            .ttl(&keys::connector_cooldown(channel_id))
            .ok()
            .flatten()
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let backoff_seconds = self
            .kv
            .ttl(&keys::connector_backoff(channel_id))
            .ok()
            .flatten()
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Some(ConnectorHealth {
            channel_id,
            connector_type: channel.kind,
            score,
            success_ratio,
            failure_ratio,
            rate_limit_ratio,
            token_status: credential
                .as_ref()
                .map(|c| c.status.as_str().to_string())
                .unwrap_or_else(|| "missing".to_string()),
            token_expires_at: credential.as_ref().and_then(|c| c.expires_at),
            last_error: credential.and_then(|c| c.last_error),
            cooldown_seconds,
            backoff_seconds,
        }))
    }

    /// Apply a temporary cooldown window to a connector.
    pub fn set_connector_cooldown(&self, channel_id: crate::types::ChannelId, seconds: u64) {
        let _ = self.kv.set_ex(
            &keys::connector_cooldown(channel_id),
            "1",
            Duration::from_secs(seconds.max(1)),
        );
    }

    /// Put a channel into a sandbox scenario so publishes return synthetic
    /// results without touching the provider.
    pub fn set_sandbox_scenario(
        &self,
        channel_id: crate::types::ChannelId,
        scenario: crate::adapters::SandboxScenario,
        ttl: Duration,
    ) {
        let _ = self.kv.set_ex(
            &keys::connector_sandbox(channel_id),
            scenario.as_str(),
            ttl.max(Duration::from_secs(30)),
        );
    }

    pub fn clear_sandbox_scenario(&self, channel_id: crate::types::ChannelId) {
        let _ = self.kv.delete(&keys::connector_sandbox(channel_id));
    }

    /// Re-enable a channel after operator intervention.
    pub fn reenable_connector(
        &self,
        tenant_id: TenantId,
        channel_id: crate::types::ChannelId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutpostError> {
        Ok(self
            .store
            .set_channel_status(tenant_id, channel_id, ChannelStatus::Active, now)?)
    }

    pub fn open_incidents(&self, limit: usize) -> Result<Vec<PlatformIncident>, OutpostError> {
        Ok(self.store.open_incidents(limit)?)
    }

    pub fn resolve_incident(
        &self,
        incident_id: IncidentId,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, OutpostError> {
        Ok(self.store.resolve_incident(incident_id, resolved_by, now)?)
    }
}

/// Record a latency sample onto the bounded KV list; `request_latency_ms`
/// also refreshes the rolling average the health score reads.
pub fn append_perf_sample(kv: &dyn Kv, metric_name: &str, value_ms: f64) {
    let key = keys::perf_samples(metric_name);
    let _ = kv.list_push_trim(&key, &format!("{value_ms:.6}"), 500);
    if metric_name == "request_latency_ms" {
        if let Ok(samples) = kv.list_range(&key, 500) {
            let values: Vec<f64> = samples.iter().filter_map(|raw| raw.parse().ok()).collect();
            if !values.is_empty() {
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                let _ = kv.set_ex(
                    "platform:perf:request_latency_ms:avg",
                    &format!("{avg:.6}"),
                    Duration::from_secs(300),
                );
            }
        }
    }
}
