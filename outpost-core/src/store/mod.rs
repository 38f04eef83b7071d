//! Transactional persistence for the engine.
//!
//! The `Store` trait exposes typed, tenant-scoped accessors — there is no
//! unscoped read over tenant data, which is how the layer refuses queries
//! that omit `tenant_id`. Writes that must be atomic across entities (a
//! state transition plus the event describing it) are single trait methods,
//! so every backend carries the event-in-same-transaction invariant
//! structurally. Methods prefixed with `platform_` are operator/scheduler
//! scans that intentionally cross tenants.
//!
//! Backends: [`MemoryStore`] (tests, embedded) and [`SqliteStore`].

pub mod memory;
pub mod models;
pub mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::types::{
    CampaignId, ChannelId, ChannelKind, ContentItemId, IncidentId, PostId, ProjectId, RuleId,
    RunId, TemplateId, TenantId,
};

pub use memory::MemoryStore;
pub use models::*;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Aggregated attempt counts over a window of publish events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptStats {
    pub attempts: u64,
    pub failures: u64,
}

impl AttemptStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.failures as f64 / self.attempts as f64
    }
}

/// Transactional persistence used by every engine component.
pub trait Store: Send + Sync {
    // --- tenants & projects -------------------------------------------------

    fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()>;
    fn insert_project(&self, project: &Project) -> StoreResult<()>;
    /// Platform scan used by risk scoring and auto-recovery.
    fn platform_tenant_ids(&self) -> StoreResult<Vec<TenantId>>;

    // --- posts --------------------------------------------------------------

    fn insert_post(&self, post: &Post) -> StoreResult<()>;
    /// Insert a post together with its `PostScheduled` event.
    fn insert_post_with_event(&self, post: &Post, event: &PublishEvent) -> StoreResult<()>;
    fn post(&self, tenant_id: TenantId, post_id: PostId) -> StoreResult<Option<Post>>;
    /// Move a post into `scheduled` at `publish_at` when its current status
    /// is one of `from`; writes the supplied event in the same transaction.
    /// Returns false when the post was not in an eligible state.
    fn schedule_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        publish_at: DateTime<Utc>,
        from: &[PostStatus],
        event: &PublishEvent,
    ) -> StoreResult<bool>;
    /// Claim due posts: `status = scheduled AND publish_at <= now`, each
    /// transitioned to `publishing` with a `PostPublishingStarted` event in
    /// the same transaction. The compare-and-swap on status makes concurrent
    /// scheduler passes claim disjoint sets.
    fn platform_claim_due_posts(&self, now: DateTime<Utc>, limit: usize)
    -> StoreResult<Vec<Post>>;
    /// Undo a claim whose enqueue ultimately failed.
    fn revert_post_to_scheduled(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        note: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Write the aggregate outcome of a publish job plus its terminal event.
    fn finalize_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        status: PostStatus,
        last_error: Option<&str>,
        event: &PublishEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
    fn posts_by_status(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        statuses: &[PostStatus],
        limit: usize,
    ) -> StoreResult<Vec<Post>>;
    fn count_posts_created_between(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<u64>;

    // --- channels -----------------------------------------------------------

    fn insert_channel(&self, channel: &Channel) -> StoreResult<()>;
    fn channel(&self, tenant_id: TenantId, channel_id: ChannelId) -> StoreResult<Option<Channel>>;
    fn project_channels(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> StoreResult<Vec<Channel>>;
    fn active_channel_of_kind(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        kind: ChannelKind,
    ) -> StoreResult<Option<Channel>>;
    fn set_channel_status(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        status: ChannelStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // --- connector credentials ----------------------------------------------

    fn connector_credential(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
    ) -> StoreResult<Option<ConnectorCredential>>;
    fn upsert_connector_credential(&self, credential: &ConnectorCredential) -> StoreResult<()>;
    fn set_credential_status(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        status: CredentialStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    // --- publications -------------------------------------------------------

    fn channel_publication(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        channel_id: ChannelId,
    ) -> StoreResult<Option<ChannelPublication>>;
    /// Insert a publication together with its `ChannelPublishSucceeded`
    /// event. Returns `StoreError::Conflict` when the `(tenant, post,
    /// channel)` or `(tenant, channel, external_post_id)` uniqueness is
    /// violated — the caller treats that as idempotent success.
    fn insert_channel_publication(
        &self,
        publication: &ChannelPublication,
        event: &PublishEvent,
    ) -> StoreResult<()>;
    fn website_publication_for_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> StoreResult<Option<WebsitePublication>>;
    fn insert_website_publication(
        &self,
        publication: &WebsitePublication,
        event: &PublishEvent,
    ) -> StoreResult<()>;
    fn website_slug_exists(&self, tenant_id: TenantId, slug: &str) -> StoreResult<bool>;

    // --- publish events -----------------------------------------------------

    fn append_publish_event(&self, event: &PublishEvent) -> StoreResult<()>;
    fn publish_events_for_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> StoreResult<Vec<PublishEvent>>;
    /// Events strictly after `after`, ascending by creation time. Platform
    /// scan backing the event-rule cursor.
    fn platform_publish_events_after(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<PublishEvent>>;
    /// Failed delivery attempts so far for one (post, channel).
    fn count_channel_failures(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        channel_id: ChannelId,
    ) -> StoreResult<u32>;
    /// Most recent per-channel outcomes (newest first) since `since`.
    fn recent_channel_outcomes(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<EventStatus>>;
    /// Delivery-attempt events for one channel (newest first); feeds
    /// connector health scoring.
    fn channel_attempt_events(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<PublishEvent>>;
    /// Attempt/failure counts since `since`, optionally tenant-scoped.
    fn publish_attempt_stats(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptStats>;
    /// Channels with at least `min_failures` failed attempts since `since`.
    fn platform_channels_with_failures(
        &self,
        since: DateTime<Utc>,
        min_failures: u64,
    ) -> StoreResult<Vec<(TenantId, ChannelId, u64)>>;
    /// `publish_duration_ms` samples recorded on delivery events.
    fn platform_publish_duration_samples(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<f64>>;

    // --- automation rules & runs --------------------------------------------

    fn insert_automation_rule(&self, rule: &AutomationRule) -> StoreResult<()>;
    fn automation_rule(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        rule_id: RuleId,
    ) -> StoreResult<Option<AutomationRule>>;
    /// Enabled rules with one of the given triggers, across tenants
    /// (scheduler scan).
    fn platform_enabled_rules(&self, triggers: &[TriggerKind])
    -> StoreResult<Vec<AutomationRule>>;
    fn latest_run_created_at(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        rule_id: RuleId,
    ) -> StoreResult<Option<DateTime<Utc>>>;
    /// Create a run plus its `AutomationRunQueued` event unless a run for
    /// the same rule exists within `window` in a non-failed state. Returns
    /// whether the run was created (the anti-stampede gate).
    fn create_run_if_no_recent(
        &self,
        run: &AutomationRun,
        event: &AutomationEvent,
        window: Duration,
    ) -> StoreResult<bool>;
    fn automation_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> StoreResult<Option<AutomationRun>>;
    /// queued -> running CAS with its start event; false when the run is
    /// already terminal or running.
    fn start_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        now: DateTime<Utc>,
        event: &AutomationEvent,
    ) -> StoreResult<bool>;
    fn finish_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        status: RunStatus,
        stats: &Value,
        now: DateTime<Utc>,
        event: &AutomationEvent,
    ) -> StoreResult<()>;
    fn append_automation_event(&self, event: &AutomationEvent) -> StoreResult<()>;
    fn automation_events_for_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> StoreResult<Vec<AutomationEvent>>;

    // --- content ------------------------------------------------------------

    /// Insert a content item with any automation events describing it.
    fn insert_content_item(
        &self,
        item: &ContentItem,
        events: &[AutomationEvent],
    ) -> StoreResult<()>;
    fn content_items_by_status(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        statuses: &[ContentStatus],
    ) -> StoreResult<Vec<ContentItem>>;
    fn set_content_item_status(
        &self,
        tenant_id: TenantId,
        item_id: ContentItemId,
        status: ContentStatus,
    ) -> StoreResult<bool>;
    fn duplicate_title_exists(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        title: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool>;
    fn content_items_since(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ContentItem>>;
    fn insert_content_template(&self, template: &ContentTemplate) -> StoreResult<()>;
    fn content_template(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        template_id: TemplateId,
    ) -> StoreResult<Option<ContentTemplate>>;
    fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()>;
    fn campaign(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<Campaign>>;

    // --- retry policies & rate limits ---------------------------------------

    fn channel_retry_policy(&self, kind: ChannelKind)
    -> StoreResult<Option<ChannelRetryPolicy>>;
    fn upsert_channel_retry_policy(&self, policy: &ChannelRetryPolicy) -> StoreResult<()>;
    fn platform_rate_limit(&self, kind: ChannelKind) -> StoreResult<Option<PlatformRateLimit>>;
    fn upsert_platform_rate_limit(&self, limit: &PlatformRateLimit) -> StoreResult<()>;

    // --- feature flags ------------------------------------------------------

    fn list_feature_flags(&self) -> StoreResult<Vec<FeatureFlag>>;
    fn upsert_feature_flag(&self, flag: &FeatureFlag) -> StoreResult<()>;

    // --- incidents ----------------------------------------------------------

    fn insert_incident(&self, incident: &PlatformIncident) -> StoreResult<()>;
    fn open_incidents(&self, limit: usize) -> StoreResult<Vec<PlatformIncident>>;
    fn resolve_incident(
        &self,
        incident_id: IncidentId,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // --- tenant risk --------------------------------------------------------

    fn upsert_tenant_risk(&self, score: &TenantRiskScore) -> StoreResult<()>;
    fn tenant_risk(&self, tenant_id: TenantId) -> StoreResult<Option<TenantRiskScore>>;

    // --- billing view -------------------------------------------------------

    fn company_subscription(
        &self,
        tenant_id: TenantId,
    ) -> StoreResult<Option<CompanySubscription>>;
    fn upsert_company_subscription(&self, subscription: &CompanySubscription) -> StoreResult<()>;
    fn company_usage(&self, tenant_id: TenantId) -> StoreResult<Option<CompanyUsage>>;
    fn upsert_company_usage(&self, usage: &CompanyUsage) -> StoreResult<()>;
    fn increment_posts_used(&self, tenant_id: TenantId, now: DateTime<Utc>) -> StoreResult<u64>;
    /// Monthly reset pass; returns the number of tenants reset.
    fn platform_reset_usage(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // --- dead letters -------------------------------------------------------

    fn insert_failed_job(&self, job: &FailedJob) -> StoreResult<()>;
    fn failed_jobs(&self, limit: usize) -> StoreResult<Vec<FailedJob>>;

    // --- AI quality policies ------------------------------------------------

    fn quality_policy(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> StoreResult<Option<AiQualityPolicy>>;
    fn upsert_quality_policy(&self, policy: &AiQualityPolicy) -> StoreResult<()>;

    // --- audit --------------------------------------------------------------

    fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()>;
    fn audit_entries(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>>;

    // --- webhook ledger -----------------------------------------------------

    /// Records a processed webhook. `Conflict` on replay.
    fn insert_stripe_event(&self, event: &StripeEvent) -> StoreResult<()>;

    // --- system health ------------------------------------------------------

    fn upsert_system_health(&self, component: &SystemHealthComponent) -> StoreResult<()>;
    fn system_health_components(&self) -> StoreResult<Vec<SystemHealthComponent>>;
    fn insert_performance_baseline(&self, baseline: &PerformanceBaseline) -> StoreResult<()>;
    fn recent_baselines(
        &self,
        component: &str,
        metric_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<PerformanceBaseline>>;

    /// Cheap liveness probe for latency measurement.
    fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_stats_failure_rate() {
        let stats = AttemptStats {
            attempts: 50,
            failures: 5,
        };
        assert!((stats.failure_rate() - 0.1).abs() < f64::EPSILON);

        let empty = AttemptStats::default();
        assert_eq!(empty.failure_rate(), 0.0);
    }
}
