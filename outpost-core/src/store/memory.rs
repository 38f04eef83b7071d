//! In-memory store backend.
//!
//! Used by tests and embedded mode. All state lives behind one mutex, so
//! every composite method is atomic exactly like a SQL transaction in the
//! sqlite backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::models::*;
use super::{AttemptStats, Store, StoreResult};
use crate::error::StoreError;
use crate::types::{
    CampaignId, ChannelId, ChannelKind, ContentItemId, IncidentId, PostId, ProjectId, RuleId,
    RunId, TemplateId, TenantId,
};

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<TenantId, Tenant>,
    projects: HashMap<ProjectId, Project>,
    posts: HashMap<PostId, Post>,
    channels: HashMap<ChannelId, Channel>,
    credentials: HashMap<(TenantId, ChannelKind), ConnectorCredential>,
    channel_publications: Vec<ChannelPublication>,
    website_publications: Vec<WebsitePublication>,
    publish_events: Vec<PublishEvent>,
    automation_rules: HashMap<RuleId, AutomationRule>,
    automation_runs: HashMap<RunId, AutomationRun>,
    automation_events: Vec<AutomationEvent>,
    content_items: HashMap<ContentItemId, ContentItem>,
    content_templates: HashMap<TemplateId, ContentTemplate>,
    campaigns: HashMap<CampaignId, Campaign>,
    retry_policies: HashMap<ChannelKind, ChannelRetryPolicy>,
    rate_limits: HashMap<ChannelKind, PlatformRateLimit>,
    feature_flags: BTreeMap<String, FeatureFlag>,
    incidents: Vec<PlatformIncident>,
    risk_scores: HashMap<TenantId, TenantRiskScore>,
    subscriptions: HashMap<TenantId, CompanySubscription>,
    usages: HashMap<TenantId, CompanyUsage>,
    failed_jobs: Vec<FailedJob>,
    quality_policies: HashMap<(TenantId, ProjectId), AiQualityPolicy>,
    audit_log: Vec<AuditLogEntry>,
    stripe_events: HashMap<String, StripeEvent>,
    system_health: BTreeMap<String, SystemHealthComponent>,
    baselines: Vec<PerformanceBaseline>,
}

/// Mutex-guarded map store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(constraint: &str) -> StoreError {
    StoreError::Conflict {
        constraint: constraint.to_string(),
    }
}

fn not_found(entity: &str) -> StoreError {
    StoreError::NotFound {
        entity: entity.to_string(),
    }
}

impl Store for MemoryStore {
    fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.tenants.contains_key(&tenant.id) {
            return Err(conflict("pk_tenants"));
        }
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    fn insert_project(&self, project: &Project) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.projects.contains_key(&project.id) {
            return Err(conflict("pk_projects"));
        }
        state.projects.insert(project.id, project.clone());
        Ok(())
    }

    fn platform_tenant_ids(&self) -> StoreResult<Vec<TenantId>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<TenantId> = state.tenants.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn insert_post(&self, post: &Post) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.posts.contains_key(&post.id) {
            return Err(conflict("pk_posts"));
        }
        state.posts.insert(post.id, post.clone());
        Ok(())
    }

    fn insert_post_with_event(&self, post: &Post, event: &PublishEvent) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.posts.contains_key(&post.id) {
            return Err(conflict("pk_posts"));
        }
        state.posts.insert(post.id, post.clone());
        state.publish_events.push(event.clone());
        Ok(())
    }

    fn post(&self, tenant_id: TenantId, post_id: PostId) -> StoreResult<Option<Post>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .posts
            .get(&post_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    fn schedule_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        publish_at: DateTime<Utc>,
        from: &[PostStatus],
        event: &PublishEvent,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(post) = state
            .posts
            .get_mut(&post_id)
            .filter(|p| p.tenant_id == tenant_id)
        else {
            return Err(not_found("post"));
        };
        if !from.contains(&post.status) {
            return Ok(false);
        }
        post.status = PostStatus::Scheduled;
        post.publish_at = Some(publish_at);
        post.last_error = None;
        post.updated_at = event.created_at;
        state.publish_events.push(event.clone());
        Ok(true)
    }

    fn platform_claim_due_posts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Post>> {
        let mut state = self.state.lock().unwrap();
        let mut due_ids: Vec<PostId> = state
            .posts
            .values()
            .filter(|p| {
                p.status == PostStatus::Scheduled
                    && p.publish_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|p| p.id)
            .collect();
        due_ids.sort();
        due_ids.truncate(limit);

        let mut claimed = Vec::with_capacity(due_ids.len());
        for post_id in due_ids {
            let post = state.posts.get_mut(&post_id).expect("post id from scan");
            post.status = PostStatus::Publishing;
            post.last_error = None;
            post.updated_at = now;
            let snapshot = post.clone();
            state
                .publish_events
                .push(crate::events::publishing_started(&snapshot, "scheduler", now));
            claimed.push(snapshot);
        }
        Ok(claimed)
    }

    fn revert_post_to_scheduled(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        note: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(post) = state
            .posts
            .get_mut(&post_id)
            .filter(|p| p.tenant_id == tenant_id)
        else {
            return Err(not_found("post"));
        };
        post.status = PostStatus::Scheduled;
        post.last_error = Some(note.to_string());
        post.updated_at = now;
        Ok(())
    }

    fn finalize_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        status: PostStatus,
        last_error: Option<&str>,
        event: &PublishEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(post) = state
            .posts
            .get_mut(&post_id)
            .filter(|p| p.tenant_id == tenant_id)
        else {
            return Err(not_found("post"));
        };
        post.status = status;
        post.last_error = last_error.map(ToString::to_string);
        post.updated_at = now;
        state.publish_events.push(event.clone());
        Ok(())
    }

    fn posts_by_status(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        statuses: &[PostStatus],
        limit: usize,
    ) -> StoreResult<Vec<Post>> {
        let state = self.state.lock().unwrap();
        let mut posts: Vec<Post> = state
            .posts
            .values()
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.project_id == project_id
                    && statuses.contains(&p.status)
            })
            .cloned()
            .collect();
        posts.sort_by_key(|p| (p.created_at, p.id));
        posts.truncate(limit);
        Ok(posts)
    }

    fn count_posts_created_between(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .posts
            .values()
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.project_id == project_id
                    && p.created_at >= from
                    && p.created_at < to
            })
            .count() as u64)
    }

    fn insert_channel(&self, channel: &Channel) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let duplicate = state.channels.values().any(|c| {
            c.tenant_id == channel.tenant_id
                && c.project_id == channel.project_id
                && c.kind == channel.kind
        });
        if duplicate {
            return Err(conflict("uq_channels_tenant_project_kind"));
        }
        state.channels.insert(channel.id, channel.clone());
        Ok(())
    }

    fn channel(&self, tenant_id: TenantId, channel_id: ChannelId) -> StoreResult<Option<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .get(&channel_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    fn project_channels(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> StoreResult<Vec<Channel>> {
        let state = self.state.lock().unwrap();
        let mut channels: Vec<Channel> = state
            .channels
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.project_id == project_id)
            .cloned()
            .collect();
        channels.sort_by_key(|c| (c.created_at, c.id));
        Ok(channels)
    }

    fn active_channel_of_kind(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        kind: ChannelKind,
    ) -> StoreResult<Option<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .values()
            .find(|c| {
                c.tenant_id == tenant_id
                    && c.project_id == project_id
                    && c.kind == kind
                    && c.status == ChannelStatus::Active
            })
            .cloned())
    }

    fn set_channel_status(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        status: ChannelStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(channel) = state
            .channels
            .get_mut(&channel_id)
            .filter(|c| c.tenant_id == tenant_id)
        else {
            return Ok(false);
        };
        channel.status = status;
        channel.updated_at = now;
        Ok(true)
    }

    fn connector_credential(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
    ) -> StoreResult<Option<ConnectorCredential>> {
        let state = self.state.lock().unwrap();
        Ok(state.credentials.get(&(tenant_id, connector)).cloned())
    }

    fn upsert_connector_credential(&self, credential: &ConnectorCredential) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .credentials
            .insert((credential.tenant_id, credential.connector), credential.clone());
        Ok(())
    }

    fn set_credential_status(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        status: CredentialStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(credential) = state.credentials.get_mut(&(tenant_id, connector)) else {
            return Ok(());
        };
        credential.status = status;
        credential.last_error = last_error.map(|m| m.chars().take(512).collect());
        credential.updated_at = now;
        Ok(())
    }

    fn channel_publication(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        channel_id: ChannelId,
    ) -> StoreResult<Option<ChannelPublication>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channel_publications
            .iter()
            .find(|p| {
                p.tenant_id == tenant_id && p.post_id == post_id && p.channel_id == channel_id
            })
            .cloned())
    }

    fn insert_channel_publication(
        &self,
        publication: &ChannelPublication,
        event: &PublishEvent,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let same_target = state.channel_publications.iter().any(|p| {
            p.tenant_id == publication.tenant_id
                && p.post_id == publication.post_id
                && p.channel_id == publication.channel_id
        });
        if same_target {
            return Err(conflict("uq_channel_publications_tenant_post_channel"));
        }
        let same_external = state.channel_publications.iter().any(|p| {
            p.tenant_id == publication.tenant_id
                && p.channel_id == publication.channel_id
                && p.external_post_id == publication.external_post_id
        });
        if same_external {
            return Err(conflict("uq_channel_publications_tenant_channel_external"));
        }
        state.channel_publications.push(publication.clone());
        state.publish_events.push(event.clone());
        Ok(())
    }

    fn website_publication_for_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> StoreResult<Option<WebsitePublication>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .website_publications
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.post_id == post_id)
            .cloned())
    }

    fn insert_website_publication(
        &self,
        publication: &WebsitePublication,
        event: &PublishEvent,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .website_publications
            .iter()
            .any(|p| p.tenant_id == publication.tenant_id && p.post_id == publication.post_id)
        {
            return Err(conflict("uq_website_publications_tenant_post"));
        }
        if state
            .website_publications
            .iter()
            .any(|p| p.tenant_id == publication.tenant_id && p.slug == publication.slug)
        {
            return Err(conflict("uq_website_publications_tenant_slug"));
        }
        state.website_publications.push(publication.clone());
        state.publish_events.push(event.clone());
        Ok(())
    }

    fn website_slug_exists(&self, tenant_id: TenantId, slug: &str) -> StoreResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .website_publications
            .iter()
            .any(|p| p.tenant_id == tenant_id && p.slug == slug))
    }

    fn append_publish_event(&self, event: &PublishEvent) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.publish_events.push(event.clone());
        Ok(())
    }

    fn publish_events_for_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> StoreResult<Vec<PublishEvent>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<PublishEvent> = state
            .publish_events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.post_id == post_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    fn platform_publish_events_after(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<PublishEvent>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<PublishEvent> = state
            .publish_events
            .iter()
            .filter(|e| e.created_at > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(limit);
        Ok(events)
    }

    fn count_channel_failures(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        channel_id: ChannelId,
    ) -> StoreResult<u32> {
        let state = self.state.lock().unwrap();
        Ok(state
            .publish_events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.post_id == post_id
                    && e.channel_id == Some(channel_id)
                    && e.event_type == PublishEventType::ChannelPublishFailed
            })
            .count() as u32)
    }

    fn recent_channel_outcomes(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<EventStatus>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<&PublishEvent> = state
            .publish_events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.channel_id == Some(channel_id)
                    && e.created_at >= since
                    && e.event_type.is_channel_attempt()
            })
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        Ok(events.into_iter().take(limit).map(|e| e.status).collect())
    }

    fn channel_attempt_events(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<PublishEvent>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<PublishEvent> = state
            .publish_events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.channel_id == Some(channel_id)
                    && e.created_at >= since
                    && e.event_type.is_channel_attempt()
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        events.truncate(limit);
        Ok(events)
    }

    fn publish_attempt_stats(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptStats> {
        let state = self.state.lock().unwrap();
        let mut stats = AttemptStats::default();
        for event in &state.publish_events {
            if event.created_at < since || !event.event_type.is_channel_attempt() {
                continue;
            }
            if let Some(tenant_id) = tenant_id {
                if event.tenant_id != tenant_id {
                    continue;
                }
            }
            stats.attempts += 1;
            if event.event_type == PublishEventType::ChannelPublishFailed {
                stats.failures += 1;
            }
        }
        Ok(stats)
    }

    fn platform_channels_with_failures(
        &self,
        since: DateTime<Utc>,
        min_failures: u64,
    ) -> StoreResult<Vec<(TenantId, ChannelId, u64)>> {
        let state = self.state.lock().unwrap();
        let mut counts: BTreeMap<(TenantId, ChannelId), u64> = BTreeMap::new();
        for event in &state.publish_events {
            if event.created_at < since
                || event.event_type != PublishEventType::ChannelPublishFailed
            {
                continue;
            }
            if let Some(channel_id) = event.channel_id {
                *counts.entry((event.tenant_id, channel_id)).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count >= min_failures)
            .map(|((tenant, channel), count)| (tenant, channel, count))
            .collect())
    }

    fn platform_publish_duration_samples(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<f64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .publish_events
            .iter()
            .filter(|e| e.created_at >= since && e.event_type.is_channel_attempt())
            .filter_map(|e| e.metadata.get("publish_duration_ms").and_then(Value::as_f64))
            .take(limit)
            .collect())
    }

    fn insert_automation_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.automation_rules.contains_key(&rule.id) {
            return Err(conflict("pk_automation_rules"));
        }
        state.automation_rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn automation_rule(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        rule_id: RuleId,
    ) -> StoreResult<Option<AutomationRule>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .automation_rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == tenant_id && r.project_id == project_id)
            .cloned())
    }

    fn platform_enabled_rules(
        &self,
        triggers: &[TriggerKind],
    ) -> StoreResult<Vec<AutomationRule>> {
        let state = self.state.lock().unwrap();
        let mut rules: Vec<AutomationRule> = state
            .automation_rules
            .values()
            .filter(|r| r.is_enabled && triggers.contains(&r.trigger))
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.created_at, r.id));
        Ok(rules)
    }

    fn latest_run_created_at(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        rule_id: RuleId,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .automation_runs
            .values()
            .filter(|r| {
                r.tenant_id == tenant_id && r.project_id == project_id && r.rule_id == rule_id
            })
            .map(|r| r.created_at)
            .max())
    }

    fn create_run_if_no_recent(
        &self,
        run: &AutomationRun,
        event: &AutomationEvent,
        window: Duration,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let window_start =
            run.created_at - chrono::Duration::from_std(window).unwrap_or_default();
        let recent_exists = state.automation_runs.values().any(|r| {
            r.tenant_id == run.tenant_id
                && r.project_id == run.project_id
                && r.rule_id == run.rule_id
                && r.created_at >= window_start
                && matches!(
                    r.status,
                    RunStatus::Queued | RunStatus::Running | RunStatus::Success | RunStatus::Partial
                )
        });
        if recent_exists {
            return Ok(false);
        }
        state.automation_runs.insert(run.id, run.clone());
        state.automation_events.push(event.clone());
        Ok(true)
    }

    fn automation_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> StoreResult<Option<AutomationRun>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .automation_runs
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    fn start_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        now: DateTime<Utc>,
        event: &AutomationEvent,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(run) = state
            .automation_runs
            .get_mut(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
        else {
            return Err(not_found("automation_run"));
        };
        if run.status != RunStatus::Queued {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.started_at = Some(now);
        state.automation_events.push(event.clone());
        Ok(true)
    }

    fn finish_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        status: RunStatus,
        stats: &Value,
        now: DateTime<Utc>,
        event: &AutomationEvent,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(run) = state
            .automation_runs
            .get_mut(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
        else {
            return Err(not_found("automation_run"));
        };
        run.status = status;
        run.stats = stats.clone();
        run.finished_at = Some(now);
        state.automation_events.push(event.clone());
        Ok(())
    }

    fn append_automation_event(&self, event: &AutomationEvent) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.automation_events.push(event.clone());
        Ok(())
    }

    fn automation_events_for_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> StoreResult<Vec<AutomationEvent>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<AutomationEvent> = state
            .automation_events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.run_id == run_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    fn insert_content_item(
        &self,
        item: &ContentItem,
        events: &[AutomationEvent],
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.content_items.contains_key(&item.id) {
            return Err(conflict("pk_content_items"));
        }
        state.content_items.insert(item.id, item.clone());
        state.automation_events.extend(events.iter().cloned());
        Ok(())
    }

    fn content_items_by_status(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        statuses: &[ContentStatus],
    ) -> StoreResult<Vec<ContentItem>> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<ContentItem> = state
            .content_items
            .values()
            .filter(|i| {
                i.tenant_id == tenant_id
                    && i.project_id == project_id
                    && statuses.contains(&i.status)
            })
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.created_at, i.id));
        Ok(items)
    }

    fn set_content_item_status(
        &self,
        tenant_id: TenantId,
        item_id: ContentItemId,
        status: ContentStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(item) = state
            .content_items
            .get_mut(&item_id)
            .filter(|i| i.tenant_id == tenant_id)
        else {
            return Ok(false);
        };
        item.status = status;
        Ok(true)
    }

    fn duplicate_title_exists(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        title: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let normalized = title.trim().to_lowercase();
        let state = self.state.lock().unwrap();
        Ok(state.content_items.values().any(|i| {
            i.tenant_id == tenant_id
                && i.project_id == project_id
                && i.created_at >= since
                && i.title.trim().to_lowercase() == normalized
        }))
    }

    fn content_items_since(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ContentItem>> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<ContentItem> = state
            .content_items
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.created_at >= since)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.created_at, i.id));
        Ok(items)
    }

    fn insert_content_template(&self, template: &ContentTemplate) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.content_templates.contains_key(&template.id) {
            return Err(conflict("pk_content_templates"));
        }
        state.content_templates.insert(template.id, template.clone());
        Ok(())
    }

    fn content_template(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        template_id: TemplateId,
    ) -> StoreResult<Option<ContentTemplate>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .content_templates
            .get(&template_id)
            .filter(|t| t.tenant_id == tenant_id && t.project_id == project_id)
            .cloned())
    }

    fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.campaigns.contains_key(&campaign.id) {
            return Err(conflict("pk_campaigns"));
        }
        state.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    fn campaign(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<Campaign>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .campaigns
            .get(&campaign_id)
            .filter(|c| c.tenant_id == tenant_id && c.project_id == project_id)
            .cloned())
    }

    fn channel_retry_policy(
        &self,
        kind: ChannelKind,
    ) -> StoreResult<Option<ChannelRetryPolicy>> {
        let state = self.state.lock().unwrap();
        Ok(state.retry_policies.get(&kind).cloned())
    }

    fn upsert_channel_retry_policy(&self, policy: &ChannelRetryPolicy) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.retry_policies.insert(policy.channel_kind, policy.clone());
        Ok(())
    }

    fn platform_rate_limit(&self, kind: ChannelKind) -> StoreResult<Option<PlatformRateLimit>> {
        let state = self.state.lock().unwrap();
        Ok(state.rate_limits.get(&kind).cloned())
    }

    fn upsert_platform_rate_limit(&self, limit: &PlatformRateLimit) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.rate_limits.insert(limit.platform, limit.clone());
        Ok(())
    }

    fn list_feature_flags(&self) -> StoreResult<Vec<FeatureFlag>> {
        let state = self.state.lock().unwrap();
        Ok(state.feature_flags.values().cloned().collect())
    }

    fn upsert_feature_flag(&self, flag: &FeatureFlag) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.feature_flags.insert(flag.key.clone(), flag.clone());
        Ok(())
    }

    fn insert_incident(&self, incident: &PlatformIncident) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.incidents.push(incident.clone());
        Ok(())
    }

    fn open_incidents(&self, limit: usize) -> StoreResult<Vec<PlatformIncident>> {
        let state = self.state.lock().unwrap();
        let mut incidents: Vec<PlatformIncident> = state
            .incidents
            .iter()
            .filter(|i| i.status == IncidentStatus::Open)
            .cloned()
            .collect();
        incidents.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        incidents.truncate(limit);
        Ok(incidents)
    }

    fn resolve_incident(
        &self,
        incident_id: IncidentId,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(incident) = state.incidents.iter_mut().find(|i| i.id == incident_id) else {
            return Ok(false);
        };
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now);
        if let Some(object) = incident.metadata.as_object_mut() {
            object.insert("resolved_by".to_string(), Value::String(resolved_by.to_string()));
        }
        Ok(true)
    }

    fn upsert_tenant_risk(&self, score: &TenantRiskScore) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.risk_scores.insert(score.tenant_id, score.clone());
        Ok(())
    }

    fn tenant_risk(&self, tenant_id: TenantId) -> StoreResult<Option<TenantRiskScore>> {
        let state = self.state.lock().unwrap();
        Ok(state.risk_scores.get(&tenant_id).cloned())
    }

    fn company_subscription(
        &self,
        tenant_id: TenantId,
    ) -> StoreResult<Option<CompanySubscription>> {
        let state = self.state.lock().unwrap();
        Ok(state.subscriptions.get(&tenant_id).cloned())
    }

    fn upsert_company_subscription(&self, subscription: &CompanySubscription) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .insert(subscription.tenant_id, subscription.clone());
        Ok(())
    }

    fn company_usage(&self, tenant_id: TenantId) -> StoreResult<Option<CompanyUsage>> {
        let state = self.state.lock().unwrap();
        Ok(state.usages.get(&tenant_id).cloned())
    }

    fn upsert_company_usage(&self, usage: &CompanyUsage) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.usages.insert(usage.tenant_id, usage.clone());
        Ok(())
    }

    fn increment_posts_used(&self, tenant_id: TenantId, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        let usage = state.usages.entry(tenant_id).or_insert_with(|| CompanyUsage {
            tenant_id,
            posts_used_current_period: 0,
            period_started_at: now,
        });
        usage.posts_used_current_period += 1;
        Ok(usage.posts_used_current_period)
    }

    fn platform_reset_usage(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut reset = 0;
        for usage in state.usages.values_mut() {
            usage.posts_used_current_period = 0;
            usage.period_started_at = now;
            reset += 1;
        }
        Ok(reset)
    }

    fn insert_failed_job(&self, job: &FailedJob) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.failed_jobs.push(job.clone());
        Ok(())
    }

    fn failed_jobs(&self, limit: usize) -> StoreResult<Vec<FailedJob>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<FailedJob> = state.failed_jobs.clone();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn quality_policy(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> StoreResult<Option<AiQualityPolicy>> {
        let state = self.state.lock().unwrap();
        Ok(state.quality_policies.get(&(tenant_id, project_id)).cloned())
    }

    fn upsert_quality_policy(&self, policy: &AiQualityPolicy) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .quality_policies
            .insert((policy.tenant_id, policy.project_id), policy.clone());
        Ok(())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.audit_log.push(entry.clone());
        Ok(())
    }

    fn audit_entries(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<AuditLogEntry> = state
            .audit_log
            .iter()
            .filter(|e| tenant_id.is_none() || e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    fn insert_stripe_event(&self, event: &StripeEvent) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.stripe_events.contains_key(&event.event_id) {
            return Err(conflict("uq_stripe_events_event_id"));
        }
        state
            .stripe_events
            .insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    fn upsert_system_health(&self, component: &SystemHealthComponent) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .system_health
            .insert(component.component.clone(), component.clone());
        Ok(())
    }

    fn system_health_components(&self) -> StoreResult<Vec<SystemHealthComponent>> {
        let state = self.state.lock().unwrap();
        Ok(state.system_health.values().cloned().collect())
    }

    fn insert_performance_baseline(&self, baseline: &PerformanceBaseline) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.baselines.push(baseline.clone());
        Ok(())
    }

    fn recent_baselines(
        &self,
        component: &str,
        metric_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<PerformanceBaseline>> {
        let state = self.state.lock().unwrap();
        let mut baselines: Vec<PerformanceBaseline> = state
            .baselines
            .iter()
            .filter(|b| b.component == component && b.metric_name == metric_name)
            .cloned()
            .collect();
        baselines.sort_by_key(|b| std::cmp::Reverse(b.recorded_at));
        baselines.truncate(limit);
        Ok(baselines)
    }

    fn ping(&self) -> StoreResult<()> {
        drop(self.state.lock().unwrap());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn seed_post(store: &MemoryStore) -> Post {
        let tenant = Tenant {
            id: TenantId::new(),
            name: "Acme".into(),
            created_at: now(),
        };
        let project = Project {
            id: ProjectId::new(),
            tenant_id: tenant.id,
            name: "Main".into(),
            created_at: now(),
        };
        store.insert_tenant(&tenant).unwrap();
        store.insert_project(&project).unwrap();
        let post = Post::new(tenant.id, project.id, "Hello", "Body", now()).scheduled_at(now());
        store.insert_post(&post).unwrap();
        post
    }

    #[test]
    fn test_tenant_isolation_on_post_reads() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let other_tenant = TenantId::new();

        assert!(store.post(post.tenant_id, post.id).unwrap().is_some());
        assert!(store.post(other_tenant, post.id).unwrap().is_none());
    }

    #[test]
    fn test_claim_due_posts_transitions_and_emits() {
        let store = MemoryStore::new();
        let post = seed_post(&store);

        let claimed = store.platform_claim_due_posts(now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, PostStatus::Publishing);

        // Second claim pass finds nothing: the CAS already moved the row.
        let again = store.platform_claim_due_posts(now(), 10).unwrap();
        assert!(again.is_empty());

        let events = store.publish_events_for_post(post.tenant_id, post.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PublishEventType::PostPublishingStarted);
    }

    #[test]
    fn test_channel_publication_uniqueness() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let channel = Channel::new(
            post.tenant_id,
            post.project_id,
            ChannelKind::LinkedIn,
            "LinkedIn",
            ChannelCapabilities::text_only(3000),
            now(),
        );
        store.insert_channel(&channel).unwrap();

        let publication = ChannelPublication {
            id: crate::types::EventId::new(),
            tenant_id: post.tenant_id,
            post_id: post.id,
            channel_id: channel.id,
            external_post_id: "urn:li:share:42".into(),
            metadata: json!({}),
            published_at: now(),
        };
        let event = events::channel_succeeded(&post, channel.id, 1, json!({}), now());
        store.insert_channel_publication(&publication, &event).unwrap();

        let mut replay = publication.clone();
        replay.id = crate::types::EventId::new();
        let err = store
            .insert_channel_publication(&replay, &event)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn test_channel_unique_per_project_kind() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let channel = Channel::new(
            post.tenant_id,
            post.project_id,
            ChannelKind::Website,
            "Website",
            ChannelCapabilities::text_only(10_000),
            now(),
        );
        store.insert_channel(&channel).unwrap();

        let duplicate = Channel::new(
            post.tenant_id,
            post.project_id,
            ChannelKind::Website,
            "Website again",
            ChannelCapabilities::text_only(10_000),
            now(),
        );
        assert!(matches!(
            store.insert_channel(&duplicate),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_create_run_if_no_recent_gates_duplicates() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let rule_id = RuleId::new();
        let run = AutomationRun {
            id: RunId::new(),
            tenant_id: post.tenant_id,
            project_id: post.project_id,
            rule_id,
            status: RunStatus::Queued,
            stats: json!({}),
            started_at: None,
            finished_at: None,
            created_at: now(),
        };
        let event = events::run_queued(&run, rule_id, "time_trigger", json!({}), now());
        assert!(store
            .create_run_if_no_recent(&run, &event, Duration::from_secs(300))
            .unwrap());

        let mut second = run.clone();
        second.id = RunId::new();
        second.created_at = now() + chrono::Duration::seconds(60);
        assert!(!store
            .create_run_if_no_recent(&second, &event, Duration::from_secs(300))
            .unwrap());

        // Outside the window the gate opens again.
        let mut third = run.clone();
        third.id = RunId::new();
        third.created_at = now() + chrono::Duration::seconds(600);
        assert!(store
            .create_run_if_no_recent(&third, &event, Duration::from_secs(300))
            .unwrap());
    }

    #[test]
    fn test_start_run_cas() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let rule_id = RuleId::new();
        let run = AutomationRun {
            id: RunId::new(),
            tenant_id: post.tenant_id,
            project_id: post.project_id,
            rule_id,
            status: RunStatus::Queued,
            stats: json!({}),
            started_at: None,
            finished_at: None,
            created_at: now(),
        };
        let queued = events::run_queued(&run, rule_id, "time_trigger", json!({}), now());
        store
            .create_run_if_no_recent(&run, &queued, Duration::from_secs(300))
            .unwrap();

        let started = events::run_started(&run, rule_id, "generate_post", now());
        assert!(store.start_run(post.tenant_id, run.id, now(), &started).unwrap());
        // Second start observes the running state and backs off.
        assert!(!store.start_run(post.tenant_id, run.id, now(), &started).unwrap());
    }

    #[test]
    fn test_stripe_event_replay_conflicts() {
        let store = MemoryStore::new();
        let event = StripeEvent {
            event_id: "evt_1".into(),
            event_type: "checkout.session.completed".into(),
            processed_at: now(),
        };
        store.insert_stripe_event(&event).unwrap();
        assert!(matches!(
            store.insert_stripe_event(&event),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_attempt_stats_and_failure_grouping() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let channel_id = ChannelId::new();
        for i in 0..5 {
            let event = events::channel_failed(
                &post,
                channel_id,
                i + 1,
                json!({"error": "boom"}),
                now() + chrono::Duration::seconds(i64::from(i)),
            );
            store.append_publish_event(&event).unwrap();
        }
        let ok = events::channel_succeeded(&post, channel_id, 6, json!({}), now());
        store.append_publish_event(&ok).unwrap();

        let stats = store
            .publish_attempt_stats(None, now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(stats.attempts, 6);
        assert_eq!(stats.failures, 5);

        let failing = store
            .platform_channels_with_failures(now() - chrono::Duration::hours(1), 5)
            .unwrap();
        assert_eq!(failing, vec![(post.tenant_id, channel_id, 5)]);
    }

    #[test]
    fn test_duplicate_title_normalizes() {
        let store = MemoryStore::new();
        let post = seed_post(&store);
        let item = ContentItem {
            id: ContentItemId::new(),
            tenant_id: post.tenant_id,
            project_id: post.project_id,
            campaign_id: None,
            template_id: None,
            status: ContentStatus::Draft,
            title: "  Spring Launch  ".into(),
            body: "body".into(),
            metadata: json!({}),
            source: ContentSource::Ai,
            created_at: now(),
        };
        store.insert_content_item(&item, &[]).unwrap();

        let since = now() - chrono::Duration::days(30);
        assert!(store
            .duplicate_title_exists(post.tenant_id, post.project_id, "spring launch", since)
            .unwrap());
        assert!(!store
            .duplicate_title_exists(post.tenant_id, post.project_id, "summer launch", since)
            .unwrap());
    }

    #[test]
    fn test_usage_increment_and_reset() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        assert_eq!(store.increment_posts_used(tenant, now()).unwrap(), 1);
        assert_eq!(store.increment_posts_used(tenant, now()).unwrap(), 2);
        assert_eq!(store.platform_reset_usage(now()).unwrap(), 1);
        assert_eq!(
            store.company_usage(tenant).unwrap().unwrap().posts_used_current_period,
            0
        );
    }
}
