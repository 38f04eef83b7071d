//! Row types and domain enums persisted by the store.
//!
//! Every tenant-owned row carries `tenant_id`; project-scoped rows also
//! carry `project_id`. Status enums serialize to the snake_case strings
//! used in the SQL check constraints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    CampaignId, ChannelId, ChannelKind, ContentItemId, EventId, IncidentId, PostId, ProjectId,
    RuleId, RunId, TemplateId, TenantId,
};

/// Post delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    PublishedPartial,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::PublishedPartial => "published_partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "publishing" => Some(Self::Publishing),
            "published" => Some(Self::Published),
            "published_partial" => Some(Self::PublishedPartial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A tenant (company). The isolation boundary for every other row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A workspace grouping channels and posts within a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub tenant_id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An authored piece of content moving through the publish lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub title: String,
    pub content: String,
    pub status: PostStatus,
    pub publish_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn new(
        tenant_id: TenantId,
        project_id: ProjectId,
        title: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PostId::new(),
            tenant_id,
            project_id,
            title: title.into(),
            content: content.into(),
            status: PostStatus::Draft,
            publish_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scheduled_at(mut self, publish_at: DateTime<Utc>) -> Self {
        self.status = PostStatus::Scheduled;
        self.publish_at = Some(publish_at);
        self
    }
}

/// What a channel can carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub text: bool,
    pub image: bool,
    pub video: bool,
    pub reels: bool,
    pub shorts: bool,
    pub max_length: Option<usize>,
}

impl ChannelCapabilities {
    pub fn text_only(max_length: usize) -> Self {
        Self {
            text: true,
            max_length: Some(max_length),
            ..Default::default()
        }
    }

    /// Whether any media form is supported.
    pub fn supports_media(&self) -> bool {
        self.image || self.video || self.reels || self.shorts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Disabled,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// A delivery target attached to a project. Unique per
/// `(tenant, project, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub kind: ChannelKind,
    pub name: String,
    pub status: ChannelStatus,
    pub capabilities: ChannelCapabilities,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(
        tenant_id: TenantId,
        project_id: ProjectId,
        kind: ChannelKind,
        name: impl Into<String>,
        capabilities: ChannelCapabilities,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ChannelId::new(),
            tenant_id,
            project_id,
            kind,
            name: name.into(),
            status: ChannelStatus::Active,
            capabilities,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Revoked,
    Error,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Per-tenant OAuth token set for one connector type. Unique per
/// `(tenant, connector)`. Token columns hold ciphertext only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorCredential {
    pub tenant_id: TenantId,
    pub connector: ChannelKind,
    pub encrypted_access_token: Option<String>,
    pub encrypted_refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    /// Provider-side account identity the tokens act as (member id, page id,
    /// business account id). Populated by the OAuth collaborator on connect.
    pub account_ref: Option<String>,
    pub status: CredentialStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome record of one successful delivery. Uniqueness over
/// `(tenant, post, channel)` and `(tenant, channel, external_post_id)`
/// makes redelivery idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPublication {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub post_id: PostId,
    pub channel_id: ChannelId,
    pub external_post_id: String,
    pub metadata: Value,
    pub published_at: DateTime<Utc>,
}

/// Website-channel specialization with a tenant-unique slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsitePublication {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub post_id: PostId,
    pub slug: String,
    pub title: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Publish timeline event vocabulary. One enum covers scheduling, per-channel
/// outcomes, and the three terminal aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishEventType {
    PostScheduled,
    PostPublishingStarted,
    ChannelPublishSucceeded,
    ChannelPublishFailed,
    PostPublished,
    PostPublishedPartial,
    PostPublishFailed,
    PublishNowRequested,
    PublishPaused,
}

impl PublishEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostScheduled => "PostScheduled",
            Self::PostPublishingStarted => "PostPublishingStarted",
            Self::ChannelPublishSucceeded => "ChannelPublishSucceeded",
            Self::ChannelPublishFailed => "ChannelPublishFailed",
            Self::PostPublished => "PostPublished",
            Self::PostPublishedPartial => "PostPublishedPartial",
            Self::PostPublishFailed => "PostPublishFailed",
            Self::PublishNowRequested => "PublishNowRequested",
            Self::PublishPaused => "PublishPaused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PostScheduled" => Some(Self::PostScheduled),
            "PostPublishingStarted" => Some(Self::PostPublishingStarted),
            "ChannelPublishSucceeded" => Some(Self::ChannelPublishSucceeded),
            "ChannelPublishFailed" => Some(Self::ChannelPublishFailed),
            "PostPublished" => Some(Self::PostPublished),
            "PostPublishedPartial" => Some(Self::PostPublishedPartial),
            "PostPublishFailed" => Some(Self::PostPublishFailed),
            "PublishNowRequested" => Some(Self::PublishNowRequested),
            "PublishPaused" => Some(Self::PublishPaused),
            _ => None,
        }
    }

    /// Whether the event counts as a per-channel delivery attempt.
    pub fn is_channel_attempt(&self) -> bool {
        matches!(
            self,
            Self::ChannelPublishSucceeded | Self::ChannelPublishFailed
        )
    }
}

/// Append-only publish audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub post_id: PostId,
    pub channel_id: Option<ChannelId>,
    pub event_type: PublishEventType,
    pub status: EventStatus,
    pub attempt: u32,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Cron,
    Interval,
    Event,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cron" => Some(Self::Cron),
            "interval" => Some(Self::Interval),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GeneratePost,
    SchedulePost,
    PublishNow,
    SyncMetrics,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneratePost => "generate_post",
            Self::SchedulePost => "schedule_post",
            Self::PublishNow => "publish_now",
            Self::SyncMetrics => "sync_metrics",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generate_post" => Some(Self::GeneratePost),
            "schedule_post" => Some(Self::SchedulePost),
            "publish_now" => Some(Self::PublishNow),
            "sync_metrics" => Some(Self::SyncMetrics),
            _ => None,
        }
    }
}

/// Quiet-hours window, `HH:MM` bounds, start inclusive and end exclusive,
/// wrapping midnight when `start > end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: String,
    pub end: String,
}

/// Rule-level guardrails checked before materializing content or posts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_posts_per_day_project: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
    /// ISO dates on which nothing may be produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blackout_dates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_topic_days: Option<u32>,
    #[serde(default)]
    pub approval_required: bool,
}

/// A time- or event-driven automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub name: String,
    pub trigger: TriggerKind,
    pub trigger_config: Value,
    pub action: ActionKind,
    pub action_config: Value,
    pub guardrails: Guardrails,
    pub campaign_id: Option<CampaignId>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A run is terminal once finished; re-queueing creates a new run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failed)
    }
}

/// One execution of an automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub rule_id: RuleId,
    pub status: RunStatus,
    pub stats: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Automation audit event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AutomationEventType {
    AutomationRunQueued,
    AutomationRunStarted,
    AutomationRunCompleted,
    ContentGenerated,
    ContentGenerationFailed,
    ApprovalRequired,
    PostsScheduled,
    PublishEnqueued,
    MetricsSyncQueued,
}

impl AutomationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutomationRunQueued => "AutomationRunQueued",
            Self::AutomationRunStarted => "AutomationRunStarted",
            Self::AutomationRunCompleted => "AutomationRunCompleted",
            Self::ContentGenerated => "ContentGenerated",
            Self::ContentGenerationFailed => "ContentGenerationFailed",
            Self::ApprovalRequired => "ApprovalRequired",
            Self::PostsScheduled => "PostsScheduled",
            Self::PublishEnqueued => "PublishEnqueued",
            Self::MetricsSyncQueued => "MetricsSyncQueued",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AutomationRunQueued" => Some(Self::AutomationRunQueued),
            "AutomationRunStarted" => Some(Self::AutomationRunStarted),
            "AutomationRunCompleted" => Some(Self::AutomationRunCompleted),
            "ContentGenerated" => Some(Self::ContentGenerated),
            "ContentGenerationFailed" => Some(Self::ContentGenerationFailed),
            "ApprovalRequired" => Some(Self::ApprovalRequired),
            "PostsScheduled" => Some(Self::PostsScheduled),
            "PublishEnqueued" => Some(Self::PublishEnqueued),
            "MetricsSyncQueued" => Some(Self::MetricsSyncQueued),
            _ => None,
        }
    }
}

/// Append-only automation audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub event_type: AutomationEventType,
    pub status: EventStatus,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    NeedsReview,
    Approved,
    Rejected,
    Scheduled,
    Published,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::NeedsReview => "needs_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Scheduled => "scheduled",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "needs_review" => Some(Self::NeedsReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "scheduled" => Some(Self::Scheduled),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Ai,
    Manual,
}

impl ContentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ai" => Some(Self::Ai),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// AI- or manually authored content awaiting scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentItemId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub campaign_id: Option<CampaignId>,
    pub template_id: Option<TemplateId>,
    pub status: ContentStatus,
    pub title: String,
    pub body: String,
    pub metadata: Value,
    pub source: ContentSource,
    pub created_at: DateTime<Utc>,
}

/// Prompt template for content generation, scoped to (tenant, project).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentTemplate {
    pub id: TemplateId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub name: String,
    /// Only `post_text` templates drive the generate_post action.
    pub template_type: String,
    pub prompt_template: String,
    pub output_schema: Option<Value>,
    pub default_values: Value,
    pub created_at: DateTime<Utc>,
}

/// Campaign carrying the brand profile applied to generated content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub name: String,
    pub brand_profile: Value,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Per-channel-type retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRetryPolicy {
    pub channel_kind: ChannelKind,
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub retry_delay_seconds: u64,
}

impl ChannelRetryPolicy {
    /// Delay before the next attempt. `attempt` is the attempt that just
    /// failed, 1-based.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let attempt = attempt.max(1);
        let seconds = match self.backoff {
            BackoffKind::Linear => self.retry_delay_seconds * u64::from(attempt),
            BackoffKind::Exponential => {
                self.retry_delay_seconds * 2u64.saturating_pow(attempt - 1)
            }
        };
        std::time::Duration::from_secs(seconds)
    }
}

/// Per-platform outbound request budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRateLimit {
    pub platform: ChannelKind,
    pub requests_per_minute: u32,
}

/// A feature flag with global and per-tenant enablement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub enabled_globally: bool,
    pub enabled_per_tenant: std::collections::BTreeMap<String, bool>,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    pub fn effective_for(&self, tenant_id: Option<TenantId>) -> bool {
        if self.enabled_globally {
            return true;
        }
        tenant_id
            .and_then(|id| self.enabled_per_tenant.get(&id.to_string()).copied())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Info,
    Warning,
    Critical,
}

impl IncidentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Operator-visible platform incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformIncident {
    pub id: IncidentId,
    pub tenant_id: Option<TenantId>,
    pub incident_type: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub message: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Bucket a 0-100 composite score.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=34 => Self::Low,
            35..=59 => Self::Medium,
            60..=79 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Periodic composite risk snapshot for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRiskScore {
    pub tenant_id: TenantId,
    pub risk_score: u32,
    pub publish_failure_ratio: f64,
    pub flagged_content_ratio: f64,
    pub abuse_rate: f64,
    pub rate_limit_violations: u64,
    pub level: RiskLevel,
    pub updated_at: DateTime<Utc>,
}

/// Billing collaborator view: the tenant's subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanySubscription {
    pub tenant_id: TenantId,
    pub plan: String,
    pub max_posts_per_month: u64,
    pub status: String,
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Billing collaborator view: usage for the current period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyUsage {
    pub tenant_id: TenantId,
    pub posts_used_current_period: u64,
    pub period_started_at: DateTime<Utc>,
}

/// Dead-letter record for a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: EventId,
    pub tenant_id: Option<TenantId>,
    pub queue: String,
    pub payload: Value,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Per-(tenant, project) AI quality policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiQualityPolicy {
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub policy: Value,
    pub created_at: DateTime<Utc>,
}

/// Operator-facing audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: EventId,
    pub tenant_id: Option<TenantId>,
    pub action: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Processed-webhook ledger row backing webhook idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

/// One component row of the system health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthComponent {
    pub component: String,
    pub status: String,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub updated_at: DateTime<Utc>,
}

/// Recorded performance baseline for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub id: EventId,
    pub component: String,
    pub metric_name: String,
    pub avg_value: f64,
    pub p95_value: f64,
    pub sample_size: usize,
    pub regression_detected: bool,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_post_status_roundtrip() {
        for status in [
            PostStatus::Draft,
            PostStatus::Scheduled,
            PostStatus::Publishing,
            PostStatus::Published,
            PostStatus::PublishedPartial,
            PostStatus::Failed,
        ] {
            assert_eq!(PostStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PostStatus::parse("archived"), None);
    }

    #[test]
    fn test_post_builder_scheduled_invariant() {
        let post = Post::new(TenantId::new(), ProjectId::new(), "Hello", "Body", now())
            .scheduled_at(now());
        assert_eq!(post.status, PostStatus::Scheduled);
        assert!(post.publish_at.is_some());
    }

    #[test]
    fn test_capabilities_media_detection() {
        let text = ChannelCapabilities::text_only(3000);
        assert!(!text.supports_media());
        assert_eq!(text.max_length, Some(3000));

        let media = ChannelCapabilities {
            text: true,
            image: true,
            ..Default::default()
        };
        assert!(media.supports_media());
    }

    #[test]
    fn test_retry_policy_linear_backoff() {
        let policy = ChannelRetryPolicy {
            channel_kind: ChannelKind::LinkedIn,
            max_attempts: 5,
            backoff: BackoffKind::Linear,
            retry_delay_seconds: 30,
        };
        assert_eq!(policy.backoff_delay(1).as_secs(), 30);
        assert_eq!(policy.backoff_delay(2).as_secs(), 60);
        assert_eq!(policy.backoff_delay(3).as_secs(), 90);
    }

    #[test]
    fn test_retry_policy_exponential_backoff() {
        let policy = ChannelRetryPolicy {
            channel_kind: ChannelKind::X,
            max_attempts: 5,
            backoff: BackoffKind::Exponential,
            retry_delay_seconds: 30,
        };
        assert_eq!(policy.backoff_delay(1).as_secs(), 30);
        assert_eq!(policy.backoff_delay(2).as_secs(), 60);
        assert_eq!(policy.backoff_delay(3).as_secs(), 120);
        assert_eq!(policy.backoff_delay(4).as_secs(), 240);
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_risk_level_buckets() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(34), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(35), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(59), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(79), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
    }

    #[test]
    fn test_feature_flag_effective() {
        let tenant = TenantId::new();
        let other = TenantId::new();
        let mut flag = FeatureFlag {
            key: "enable_global_publish_circuit_breaker".into(),
            enabled_globally: false,
            enabled_per_tenant: Default::default(),
            description: String::new(),
            updated_at: now(),
        };
        assert!(!flag.effective_for(None));
        assert!(!flag.effective_for(Some(tenant)));

        flag.enabled_per_tenant.insert(tenant.to_string(), true);
        assert!(flag.effective_for(Some(tenant)));
        assert!(!flag.effective_for(Some(other)));

        flag.enabled_globally = true;
        assert!(flag.effective_for(None));
        assert!(flag.effective_for(Some(other)));
    }

    #[test]
    fn test_guardrails_serde_defaults() {
        let guardrails: Guardrails = serde_json::from_str("{}").unwrap();
        assert!(guardrails.max_posts_per_day_project.is_none());
        assert!(guardrails.quiet_hours.is_none());
        assert!(guardrails.blackout_dates.is_empty());
        assert!(!guardrails.approval_required);
    }

    #[test]
    fn test_publish_event_type_attempt_classification() {
        assert!(PublishEventType::ChannelPublishSucceeded.is_channel_attempt());
        assert!(PublishEventType::ChannelPublishFailed.is_channel_attempt());
        assert!(!PublishEventType::PostPublished.is_channel_attempt());
        assert!(!PublishEventType::PostScheduled.is_channel_attempt());
    }
}
