//! Publishing worker — idempotent per-post delivery across channels.
//!
//! Entry point is [`Publisher::publish_post`], invoked from the publishing
//! queue. Pre-flight checks the per-post lock, post state, and the
//! global/tenant circuit breakers. Delivery runs per attached channel with
//! platform rate-limit admission, connector backoff, and the adapter
//! registry's uniform contract. Aggregation decides the post's terminal
//! state or the retry schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::adapters::error_map::{NormalizedProviderError, map_provider_error};
use crate::adapters::{AdapterRegistry, PublishContext};
use crate::clock::SharedClock;
use crate::config::PublisherConfig;
use crate::credentials::CredentialVault;
use crate::error::{AdapterError, OutpostError, StoreError};
use crate::events;
use crate::kv::{Kv, keys};
use crate::queue::{Job, JobQueue};
use crate::store::models::{
    BackoffKind, Channel, ChannelPublication, ChannelRetryPolicy, ChannelStatus, CredentialStatus,
    EventStatus, FailedJob, IncidentSeverity, IncidentStatus, PlatformIncident, Post, PostStatus,
    PublishEvent, PublishEventType, WebsitePublication,
};
use crate::store::Store;
use crate::types::{ChannelKind, EventId, IncidentId, PostId, TenantId};

/// What happened to one publish job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDisposition {
    /// Post missing or not in a publishable state.
    Skipped,
    /// Another worker holds the per-post lock.
    LockedElsewhere,
    /// A circuit breaker short-circuited the job; retry later.
    BreakerPaused,
    Published,
    PublishedPartial,
    /// Re-queued with backoff.
    Retried { delay: Duration },
    Failed,
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub disposition: PublishDisposition,
    pub channels_succeeded: u32,
    pub channels_failed: u32,
}

impl PublishReport {
    fn bare(disposition: PublishDisposition) -> Self {
        Self {
            disposition,
            channels_succeeded: 0,
            channels_failed: 0,
        }
    }
}

enum ChannelOutcome {
    Success {
        idempotent: bool,
    },
    Retry {
        delay: Duration,
    },
    /// Permanent failure, including auth errors and exhausted retries.
    Permanent,
}

struct RateAdmission {
    allowed: bool,
    retry_after: Duration,
}

pub struct Publisher {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
    clock: SharedClock,
    registry: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    publishing_queue: Arc<dyn JobQueue>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        clock: SharedClock,
        registry: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        publishing_queue: Arc<dyn JobQueue>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            kv,
            clock,
            registry,
            vault,
            publishing_queue,
            config,
        }
    }

    /// Deliver one post to every active channel of its project.
    pub async fn publish_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> Result<PublishReport, OutpostError> {
        let lock_key = keys::post_lock(tenant_id, post_id);
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_secs);
        let locked = self
            .kv
            .set_nx_ex(&lock_key, &EventId::new().to_string(), lock_ttl)
            .unwrap_or(true);
        if !locked {
            info!(%tenant_id, %post_id, "publish lock held elsewhere, skipping");
            return Ok(PublishReport::bare(PublishDisposition::LockedElsewhere));
        }

        let result = self.publish_locked(tenant_id, post_id).await;
        let _ = self.kv.delete(&lock_key);
        result
    }

    async fn publish_locked(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> Result<PublishReport, OutpostError> {
        let now = self.clock.now();
        let Some(post) = self.store.post(tenant_id, post_id)? else {
            warn!(%tenant_id, %post_id, "publish job for unknown post");
            return Ok(PublishReport::bare(PublishDisposition::Skipped));
        };
        if !matches!(post.status, PostStatus::Scheduled | PostStatus::Publishing) {
            info!(%tenant_id, %post_id, status = post.status.as_str(), "post not publishable, skipping");
            return Ok(PublishReport::bare(PublishDisposition::Skipped));
        }

        if let Some(reason) = self.global_breaker_reason() {
            self.store.append_publish_event(&events_paused(&post, "global", &reason, now))?;
            return Ok(PublishReport::bare(PublishDisposition::BreakerPaused));
        }
        if let Some(reason) = self.tenant_breaker_reason(tenant_id) {
            self.store.append_publish_event(&events_paused(&post, "tenant", &reason, now))?;
            return Ok(PublishReport::bare(PublishDisposition::BreakerPaused));
        }

        let channels: Vec<Channel> = self
            .store
            .project_channels(tenant_id, post.project_id)?
            .into_iter()
            .filter(|c| c.status == ChannelStatus::Active)
            .collect();
        if channels.is_empty() {
            let message = "no active channels attached to project";
            let event = events::post_publish_failed(&post, 1, json!({ "error": message }), now);
            self.store
                .finalize_post(tenant_id, post_id, PostStatus::Failed, Some(message), &event, now)?;
            self.dead_letter(&post, message)?;
            return Ok(PublishReport::bare(PublishDisposition::Failed));
        }

        let mut succeeded = 0u32;
        let mut permanent_failed = 0u32;
        let mut retry_delay: Option<Duration> = None;
        let mut last_error: Option<String> = None;
        let mut max_attempt = 1u32;

        for channel in &channels {
            let outcome = self.deliver_to_channel(&post, channel).await?;
            match outcome {
                ChannelOutcome::Success { idempotent } => {
                    if idempotent {
                        info!(%tenant_id, %post_id, channel = %channel.kind, "channel already delivered");
                    }
                    succeeded += 1;
                }
                ChannelOutcome::Retry { delay } => {
                    retry_delay = Some(retry_delay.map_or(delay, |current| current.max(delay)));
                }
                ChannelOutcome::Permanent => permanent_failed += 1,
            }
            let attempts = self
                .store
                .count_channel_failures(tenant_id, post.id, channel.id)?;
            max_attempt = max_attempt.max(attempts.max(1));
            if let Some(error) = self.last_channel_error(&post, channel)? {
                last_error = Some(error);
            }
        }

        let now = self.clock.now();
        let report = if let Some(delay) = retry_delay {
            let job = Job::Publish {
                tenant_id,
                post_id,
                attempt: max_attempt + 1,
            };
            if let Err(err) = self.publishing_queue.enqueue_after(job, delay) {
                warn!(%tenant_id, %post_id, error = %err, "re-enqueue failed, reverting to scheduled");
                self.store.revert_post_to_scheduled(
                    tenant_id,
                    post_id,
                    "re-enqueue failed after retryable delivery failure",
                    now,
                )?;
            }
            PublishReport {
                disposition: PublishDisposition::Retried { delay },
                channels_succeeded: succeeded,
                channels_failed: permanent_failed,
            }
        } else if permanent_failed == 0 {
            let event = events::post_published(
                &post,
                max_attempt,
                json!({ "channels_succeeded": succeeded }),
                now,
            );
            self.store
                .finalize_post(tenant_id, post_id, PostStatus::Published, None, &event, now)?;
            info!(%tenant_id, %post_id, channels = succeeded, "post published");
            PublishReport {
                disposition: PublishDisposition::Published,
                channels_succeeded: succeeded,
                channels_failed: 0,
            }
        } else if succeeded > 0 {
            let event = events::post_published_partial(
                &post,
                max_attempt,
                json!({ "channels_succeeded": succeeded, "channels_failed": permanent_failed }),
                now,
            );
            self.store.finalize_post(
                tenant_id,
                post_id,
                PostStatus::PublishedPartial,
                last_error.as_deref(),
                &event,
                now,
            )?;
            warn!(%tenant_id, %post_id, succeeded, failed = permanent_failed, "post published partially");
            PublishReport {
                disposition: PublishDisposition::PublishedPartial,
                channels_succeeded: succeeded,
                channels_failed: permanent_failed,
            }
        } else {
            let message = last_error.unwrap_or_else(|| "all channel deliveries failed".to_string());
            let event = events::post_publish_failed(
                &post,
                max_attempt,
                json!({ "error": message, "channels_failed": permanent_failed }),
                now,
            );
            self.store.finalize_post(
                tenant_id,
                post_id,
                PostStatus::Failed,
                Some(&message),
                &event,
                now,
            )?;
            self.dead_letter(&post, &message)?;
            warn!(%tenant_id, %post_id, error = %message, "post publish failed");
            PublishReport {
                disposition: PublishDisposition::Failed,
                channels_succeeded: 0,
                channels_failed: permanent_failed,
            }
        };
        Ok(report)
    }

    async fn deliver_to_channel(
        &self,
        post: &Post,
        channel: &Channel,
    ) -> Result<ChannelOutcome, OutpostError> {
        let tenant_id = post.tenant_id;
        let now = self.clock.now();

        // Existing publication means an earlier attempt already landed.
        let existing_external_id = if channel.kind == ChannelKind::Website {
            self.store
                .website_publication_for_post(tenant_id, post.id)?
                .map(|p| p.slug)
        } else {
            self.store
                .channel_publication(tenant_id, post.id, channel.id)?
                .map(|p| p.external_post_id)
        };
        if let Some(external_id) = existing_external_id {
            info!(
                %tenant_id,
                post_id = %post.id,
                channel = %channel.kind,
                external_id,
                "publication already exists, idempotent success"
            );
            return Ok(ChannelOutcome::Success { idempotent: true });
        }

        let policy = self.retry_policy(channel.kind)?;
        let attempt = self
            .store
            .count_channel_failures(tenant_id, post.id, channel.id)?
            + 1;

        // Respect an active connector backoff window.
        if let Ok(Some(ttl)) = self.kv.ttl(&keys::connector_backoff(channel.id)) {
            return self
                .record_failure(
                    post,
                    channel,
                    attempt,
                    &policy,
                    map_provider_error(channel.kind.as_str(), Some("rate_limited"), "connector in backoff window"),
                    "connector in backoff window",
                    Some(ttl),
                    None,
                )
                .await;
        }

        let admission = self.check_platform_rate_limit(tenant_id, channel.kind);
        if !admission.allowed {
            let _ = self.kv.set_ex(
                &keys::connector_backoff(channel.id),
                "1",
                admission.retry_after.max(Duration::from_secs(1)),
            );
            return self
                .record_failure(
                    post,
                    channel,
                    attempt,
                    &policy,
                    map_provider_error(
                        channel.kind.as_str(),
                        Some("too_many_requests"),
                        "platform rate limit exceeded",
                    ),
                    "platform rate limit exceeded",
                    Some(admission.retry_after),
                    None,
                )
                .await;
        }

        let ctx = PublishContext {
            tenant_id,
            post: post.clone(),
            channel: channel.clone(),
        };
        let started = std::time::Instant::now();
        let adapter_budget = Duration::from_secs(self.config.adapter_timeout_secs);
        let delivery = tokio::time::timeout(adapter_budget, self.registry.deliver(&ctx)).await;
        let duration_ms = started.elapsed().as_millis() as f64;
        let _ = self.kv.list_push_trim(
            &keys::perf_samples("publish_duration_ms"),
            &format!("{duration_ms:.3}"),
            500,
        );

        let outcome = match delivery {
            Err(_) => Err(AdapterError::Retryable {
                channel_type: channel.kind.to_string(),
                message: format!("adapter timed out after {}s", adapter_budget.as_secs()),
            }),
            Ok(result) => result,
        };

        match outcome {
            Ok(success) => {
                let metadata = json!({
                    "channel_type": channel.kind.as_str(),
                    "external_post_id": success.external_post_id,
                    "publish_duration_ms": duration_ms,
                    "provider_metadata": success.metadata,
                });
                let event = events::channel_succeeded(post, channel.id, attempt, metadata, now);
                let write = if channel.kind == ChannelKind::Website {
                    self.store.insert_website_publication(
                        &WebsitePublication {
                            id: EventId::new(),
                            tenant_id,
                            project_id: post.project_id,
                            post_id: post.id,
                            slug: success.external_post_id.clone(),
                            title: post.title.clone(),
                            content: post.content.clone(),
                            published_at: now,
                        },
                        &event,
                    )
                } else {
                    self.store.insert_channel_publication(
                        &ChannelPublication {
                            id: EventId::new(),
                            tenant_id,
                            post_id: post.id,
                            channel_id: channel.id,
                            external_post_id: success.external_post_id.clone(),
                            metadata: success.metadata.clone(),
                            published_at: now,
                        },
                        &event,
                    )
                };
                match write {
                    Ok(()) => {
                        info!(
                            %tenant_id,
                            post_id = %post.id,
                            channel = %channel.kind,
                            external_id = success.external_post_id,
                            attempt,
                            "channel publish succeeded"
                        );
                        Ok(ChannelOutcome::Success { idempotent: false })
                    }
                    // A concurrent worker already recorded the publication;
                    // the unique constraint is the at-most-once guard.
                    Err(StoreError::Conflict { .. }) => {
                        Ok(ChannelOutcome::Success { idempotent: true })
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => {
                let message = err.message().to_string();
                let code_hint = match &err {
                    AdapterError::Auth { .. } => Some("auth_error"),
                    AdapterError::Permanent { .. } => Some("content_rejected"),
                    AdapterError::Retryable { .. } | AdapterError::Unsupported { .. } => None,
                };
                let normalized = map_provider_error(channel.kind.as_str(), code_hint, &message);

                if matches!(err, AdapterError::Auth { .. }) {
                    let _ = self.vault.mark_error(
                        tenant_id,
                        channel.kind,
                        &message,
                        CredentialStatus::Error,
                        now,
                    );
                }
                let force_permanent = !err.is_retryable();
                self.record_failure(
                    post,
                    channel,
                    attempt,
                    &policy,
                    normalized,
                    &message,
                    None,
                    Some(force_permanent),
                )
                .await
            }
        }
    }

    /// Emit the failure event, maintain the connector breaker, and decide
    /// retry vs permanent failure for this channel.
    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        post: &Post,
        channel: &Channel,
        attempt: u32,
        policy: &ChannelRetryPolicy,
        normalized: NormalizedProviderError,
        message: &str,
        explicit_delay: Option<Duration>,
        force_permanent: Option<bool>,
    ) -> Result<ChannelOutcome, OutpostError> {
        let tenant_id = post.tenant_id;
        let now = self.clock.now();
        let metadata = json!({
            "channel_type": channel.kind.as_str(),
            "error": message,
            "normalized_error": normalized.to_metadata(),
        });
        self.store
            .append_publish_event(&events::channel_failed(post, channel.id, attempt, metadata, now))?;
        warn!(
            %tenant_id,
            post_id = %post.id,
            channel = %channel.kind,
            attempt,
            category = normalized.category.as_str(),
            error = message,
            "channel publish failed"
        );

        self.maybe_trip_connector_breaker(tenant_id, channel)?;

        let permanent = force_permanent.unwrap_or(!normalized.retryable);
        if permanent {
            return Ok(ChannelOutcome::Permanent);
        }
        if attempt >= policy.max_attempts {
            info!(
                %tenant_id,
                post_id = %post.id,
                channel = %channel.kind,
                attempt,
                max_attempts = policy.max_attempts,
                "retry budget exhausted"
            );
            return Ok(ChannelOutcome::Permanent);
        }
        let delay = explicit_delay.unwrap_or_else(|| policy.backoff_delay(attempt));
        Ok(ChannelOutcome::Retry { delay })
    }

    /// Disable a channel after N consecutive failed attempts inside an hour
    /// with no intervening success.
    fn maybe_trip_connector_breaker(
        &self,
        tenant_id: TenantId,
        channel: &Channel,
    ) -> Result<(), OutpostError> {
        let threshold = self.config.consecutive_failure_threshold as usize;
        let now = self.clock.now();
        let outcomes = self.store.recent_channel_outcomes(
            tenant_id,
            channel.id,
            now - chrono::Duration::hours(1),
            threshold,
        )?;
        if outcomes.len() < threshold || outcomes.iter().any(|s| *s == EventStatus::Ok) {
            return Ok(());
        }

        if !self
            .store
            .set_channel_status(tenant_id, channel.id, ChannelStatus::Disabled, now)?
        {
            return Ok(());
        }
        warn!(
            %tenant_id,
            channel_id = %channel.id,
            channel = %channel.kind,
            failures = outcomes.len(),
            "connector disabled after repeated failures"
        );
        self.store.insert_incident(&PlatformIncident {
            id: IncidentId::new(),
            tenant_id: Some(tenant_id),
            incident_type: "connector_disabled_repeated_failures".to_string(),
            severity: IncidentSeverity::Warning,
            status: IncidentStatus::Open,
            message: format!("Channel {} disabled after repeated failures", channel.id),
            metadata: json!({ "failures": outcomes.len(), "channel_type": channel.kind.as_str() }),
            created_at: now,
            resolved_at: None,
        })?;
        self.store.append_audit(&crate::store::models::AuditLogEntry {
            id: EventId::new(),
            tenant_id: Some(tenant_id),
            action: "auto_recovery.connector_disabled".to_string(),
            metadata: json!({ "channel_id": channel.id.to_string(), "failures": outcomes.len() }),
            created_at: now,
        })?;
        Ok(())
    }

    fn retry_policy(&self, kind: ChannelKind) -> Result<ChannelRetryPolicy, OutpostError> {
        Ok(self
            .store
            .channel_retry_policy(kind)?
            .unwrap_or(ChannelRetryPolicy {
                channel_kind: kind,
                max_attempts: self.config.default_max_attempts,
                backoff: BackoffKind::Exponential,
                retry_delay_seconds: self.config.default_retry_delay_secs,
            }))
    }

    /// Per-minute admission bucket. KV errors fail open.
    fn check_platform_rate_limit(&self, tenant_id: TenantId, kind: ChannelKind) -> RateAdmission {
        let limit = self
            .store
            .platform_rate_limit(kind)
            .ok()
            .flatten()
            .map(|l| l.requests_per_minute.max(1))
            .unwrap_or(self.config.default_requests_per_minute);

        let now = self.clock.now();
        let bucket = keys::platform_rate_limit(kind.as_str(), now);
        let current = match self.kv.incr(&bucket) {
            Ok(current) => current,
            Err(_) => {
                return RateAdmission {
                    allowed: true,
                    retry_after: Duration::ZERO,
                };
            }
        };
        if current == 1 {
            let _ = self.kv.expire(&bucket, Duration::from_secs(65));
        }
        let retry_after = self
            .kv
            .ttl(&bucket)
            .ok()
            .flatten()
            .unwrap_or(Duration::from_secs(60));
        let allowed = current <= i64::from(limit);
        if !allowed {
            // Feeds the abuse component of the tenant risk score.
            let violations_key = keys::tenant_rate_limit_violations(tenant_id);
            if let Ok(count) = self.kv.incr(&violations_key) {
                if count == 1 {
                    let _ = self.kv.expire(&violations_key, Duration::from_secs(86_400));
                }
            }
        }
        RateAdmission {
            allowed,
            retry_after,
        }
    }

    fn global_breaker_reason(&self) -> Option<String> {
        let paused = self
            .kv
            .get(keys::GLOBAL_PUBLISH_BREAKER)
            .ok()
            .flatten()
            .map(|v| v == "1")
            .unwrap_or(false);
        if !paused {
            return None;
        }
        Some(
            self.kv
                .get(&keys::global_breaker_reason())
                .ok()
                .flatten()
                .unwrap_or_else(|| "global publish breaker enabled".to_string()),
        )
    }

    fn tenant_breaker_reason(&self, tenant_id: TenantId) -> Option<String> {
        let paused = self
            .kv
            .get(&keys::tenant_breaker(tenant_id))
            .ok()
            .flatten()
            .map(|v| v == "1")
            .unwrap_or(false);
        if !paused {
            return None;
        }
        Some(
            self.kv
                .get(&keys::tenant_breaker_reason(tenant_id))
                .ok()
                .flatten()
                .unwrap_or_else(|| "tenant publish breaker enabled".to_string()),
        )
    }

    fn last_channel_error(
        &self,
        post: &Post,
        channel: &Channel,
    ) -> Result<Option<String>, OutpostError> {
        let events = self
            .store
            .publish_events_for_post(post.tenant_id, post.id)?;
        Ok(events
            .iter()
            .rev()
            .find(|e| {
                e.channel_id == Some(channel.id)
                    && e.event_type == PublishEventType::ChannelPublishFailed
            })
            .and_then(|e| e.metadata.get("error"))
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }

    fn dead_letter(&self, post: &Post, error: &str) -> Result<(), OutpostError> {
        self.store.insert_failed_job(&FailedJob {
            id: EventId::new(),
            tenant_id: Some(post.tenant_id),
            queue: crate::queue::QUEUE_PUBLISHING.to_string(),
            payload: json!({ "post_id": post.id.to_string(), "title": post.title }),
            error: error.to_string(),
            created_at: self.clock.now(),
        })?;
        Ok(())
    }
}

fn events_paused(post: &Post, scope: &str, reason: &str, now: DateTime<Utc>) -> PublishEvent {
    PublishEvent {
        id: EventId::new(),
        tenant_id: post.tenant_id,
        project_id: post.project_id,
        post_id: post.id,
        channel_id: None,
        event_type: PublishEventType::PublishPaused,
        status: EventStatus::Error,
        attempt: 1,
        metadata: json!({ "breaker": scope, "reason": reason }),
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockAdapter, MockResult};
    use crate::clock::{Clock, ManualClock};
    use crate::encryption::TokenCipher;
    use crate::kv::MemoryKv;
    use crate::queue::MemoryQueue;
    use crate::store::models::{ChannelCapabilities, Project, Tenant};
    use crate::store::MemoryStore;
    use crate::types::ProjectId;
    use chrono::TimeZone;

    struct Fixture {
        publisher: Publisher,
        store: Arc<MemoryStore>,
        kv: Arc<MemoryKv>,
        clock: Arc<ManualClock>,
        queue: Arc<MemoryQueue>,
        tenant_id: TenantId,
        project_id: ProjectId,
    }

    fn fixture(register: impl FnOnce(&mut AdapterRegistry)) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let vault = Arc::new(CredentialVault::new(
            store.clone(),
            kv.clone(),
            TokenCipher::from_secret("publisher-test"),
        ));
        let mut registry = AdapterRegistry::new(vault.clone(), kv.clone());
        register(&mut registry);
        let queue = Arc::new(MemoryQueue::new(
            crate::queue::QUEUE_PUBLISHING,
            clock.clone(),
            kv.clone(),
        ));
        let publisher = Publisher::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            Arc::new(registry),
            vault,
            queue.clone(),
            PublisherConfig::default(),
        );

        let tenant_id = TenantId::new();
        let project_id = ProjectId::new();
        store
            .insert_tenant(&Tenant {
                id: tenant_id,
                name: "Acme".into(),
                created_at: clock.now(),
            })
            .unwrap();
        store
            .insert_project(&Project {
                id: project_id,
                tenant_id,
                name: "Main".into(),
                created_at: clock.now(),
            })
            .unwrap();

        Fixture {
            publisher,
            store,
            kv,
            clock,
            queue,
            tenant_id,
            project_id,
        }
    }

    fn add_channel(fixture: &Fixture, kind: ChannelKind) -> Channel {
        let channel = Channel::new(
            fixture.tenant_id,
            fixture.project_id,
            kind,
            kind.to_string(),
            ChannelCapabilities::text_only(3000),
            fixture.clock.now(),
        );
        fixture.store.insert_channel(&channel).unwrap();
        channel
    }

    fn add_scheduled_post(fixture: &Fixture) -> Post {
        let post = Post::new(
            fixture.tenant_id,
            fixture.project_id,
            "Hello",
            "Body",
            fixture.clock.now(),
        )
        .scheduled_at(fixture.clock.now());
        fixture.store.insert_post(&post).unwrap();
        post
    }

    fn event_types(fixture: &Fixture, post: &Post) -> Vec<PublishEventType> {
        fixture
            .store
            .publish_events_for_post(fixture.tenant_id, post.id)
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_single_channel_success_publishes_post() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn).succeed_with("urn:li:share:42"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::Published);
        assert_eq!(report.channels_succeeded, 1);

        let reloaded = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Published);

        let types = event_types(&fixture, &post);
        assert!(types.contains(&PublishEventType::ChannelPublishSucceeded));
        assert!(types.contains(&PublishEventType::PostPublished));
    }

    #[tokio::test]
    async fn test_idempotent_redelivery_skips_adapter() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn).succeed_with("urn:li:share:42"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();

        // Re-run the job: the post is already published so it is skipped
        // before any adapter call.
        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::Skipped);

        let events = fixture
            .store
            .publish_events_for_post(fixture.tenant_id, post.id)
            .unwrap();
        let success_count = events
            .iter()
            .filter(|e| e.event_type == PublishEventType::ChannelPublishSucceeded)
            .count();
        assert_eq!(success_count, 1);
    }

    #[tokio::test]
    async fn test_retryable_failures_requeue_with_backoff() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn)
                    .then(MockResult::Retryable("HTTP 500 upstream".into()))
                    .succeed_with("urn:li:share:42"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        let PublishDisposition::Retried { delay } = report.disposition else {
            panic!("expected retry, got {:?}", report.disposition);
        };
        assert_eq!(delay, Duration::from_secs(30));

        // Post stays in publishing while the retry waits.
        let reloaded = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Publishing);

        // Delayed job becomes visible after the backoff.
        assert!(fixture.queue.pop_ready(fixture.clock.now()).unwrap().is_none());
        fixture.clock.advance(Duration::from_secs(31));
        let job = fixture.queue.pop_ready(fixture.clock.now()).unwrap().unwrap();
        assert!(matches!(job, Job::Publish { attempt: 2, .. }));

        // Second run succeeds.
        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::Published);
    }

    #[tokio::test]
    async fn test_partial_success() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::Website).succeed_with("hello-slug"),
            ));
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn)
                    .then(MockResult::Permanent("policy violation".into())),
            ));
        });
        add_channel(&fixture, ChannelKind::Website);
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::PublishedPartial);
        assert_eq!(report.channels_succeeded, 1);
        assert_eq!(report.channels_failed, 1);

        let reloaded = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::PublishedPartial);

        // Website row exists, LinkedIn does not.
        assert!(fixture
            .store
            .website_publication_for_post(fixture.tenant_id, post.id)
            .unwrap()
            .is_some());
        let types = event_types(&fixture, &post);
        assert!(types.contains(&PublishEventType::ChannelPublishSucceeded));
        assert!(types.contains(&PublishEventType::ChannelPublishFailed));
        assert!(types.contains(&PublishEventType::PostPublishedPartial));
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn)
                    .then(MockResult::Permanent("policy violation".into())),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::Failed);

        let reloaded = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Failed);
        assert!(reloaded.last_error.unwrap().contains("policy violation"));

        let jobs = fixture.store.failed_jobs(10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, "publishing");
    }

    #[tokio::test]
    async fn test_global_breaker_pauses_before_adapter() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn).succeed_with("x"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        fixture.kv.set(keys::GLOBAL_PUBLISH_BREAKER, "1").unwrap();
        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::BreakerPaused);

        let types = event_types(&fixture, &post);
        assert_eq!(types, vec![PublishEventType::PublishPaused]);
        // Status unchanged so a later pass can pick it up.
        let reloaded = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_tenant_breaker_pauses() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn).succeed_with("x"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        fixture
            .kv
            .set_ex(
                &keys::tenant_breaker(fixture.tenant_id),
                "1",
                Duration::from_secs(1800),
            )
            .unwrap();
        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::BreakerPaused);
    }

    #[tokio::test]
    async fn test_connector_breaker_trips_after_threshold() {
        let fixture = fixture(|registry| {
            let mut adapter = MockAdapter::new(ChannelKind::LinkedIn);
            for _ in 0..5 {
                adapter = adapter.then(MockResult::Permanent("policy violation".into()));
            }
            registry.register(Box::new(adapter));
        });
        let channel = add_channel(&fixture, ChannelKind::LinkedIn);

        // Five posts each failing once on the same channel within the hour.
        for _ in 0..5 {
            let post = add_scheduled_post(&fixture);
            fixture
                .publisher
                .publish_post(fixture.tenant_id, post.id)
                .await
                .unwrap();
            fixture.clock.advance(Duration::from_secs(60));
        }

        let reloaded = fixture
            .store
            .channel(fixture.tenant_id, channel.id)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ChannelStatus::Disabled);

        let incidents = fixture.store.open_incidents(10).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(
            incidents[0].incident_type,
            "connector_disabled_repeated_failures"
        );

        let audit = fixture.store.audit_entries(Some(fixture.tenant_id), 10).unwrap();
        assert!(audit
            .iter()
            .any(|entry| entry.action == "auto_recovery.connector_disabled"));
    }

    #[tokio::test]
    async fn test_rate_limit_admission_blocks_and_backs_off() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn).succeed_with("x"),
            ));
        });
        let channel = add_channel(&fixture, ChannelKind::LinkedIn);
        fixture
            .store
            .upsert_platform_rate_limit(&crate::store::models::PlatformRateLimit {
                platform: ChannelKind::LinkedIn,
                requests_per_minute: 1,
            })
            .unwrap();

        // Fill the bucket for this minute.
        let bucket = keys::platform_rate_limit("linkedin", fixture.clock.now());
        fixture.kv.incr(&bucket).unwrap();

        let post = add_scheduled_post(&fixture);
        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert!(matches!(report.disposition, PublishDisposition::Retried { .. }));

        // Backoff key set for the channel, violation counted for the tenant.
        assert!(fixture
            .kv
            .get(&keys::connector_backoff(channel.id))
            .unwrap()
            .is_some());
        assert_eq!(
            fixture
                .kv
                .get(&keys::tenant_rate_limit_violations(fixture.tenant_id))
                .unwrap()
                .as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_concurrent_publish_at_most_once() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn).succeed_with("urn:li:share:7"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        // Simulate a second worker holding the lock.
        let lock_key = keys::post_lock(fixture.tenant_id, post.id);
        fixture
            .kv
            .set_nx_ex(&lock_key, "other-worker", Duration::from_secs(180))
            .unwrap();

        let report = fixture
            .publisher
            .publish_post(fixture.tenant_id, post.id)
            .await
            .unwrap();
        assert_eq!(report.disposition, PublishDisposition::LockedElsewhere);
        assert!(fixture
            .store
            .publish_events_for_post(fixture.tenant_id, post.id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_attempts_monotonic_in_event_log() {
        let fixture = fixture(|registry| {
            registry.register(Box::new(
                MockAdapter::new(ChannelKind::LinkedIn)
                    .then(MockResult::Retryable("HTTP 500".into()))
                    .then(MockResult::Retryable("HTTP 502".into()))
                    .succeed_with("urn:li:share:42"),
            ));
        });
        add_channel(&fixture, ChannelKind::LinkedIn);
        let post = add_scheduled_post(&fixture);

        for _ in 0..3 {
            fixture
                .publisher
                .publish_post(fixture.tenant_id, post.id)
                .await
                .unwrap();
            fixture.clock.advance(Duration::from_secs(120));
        }

        let events = fixture
            .store
            .publish_events_for_post(fixture.tenant_id, post.id)
            .unwrap();
        let attempts: Vec<u32> = events
            .iter()
            .filter(|e| e.event_type.is_channel_attempt())
            .map(|e| e.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == PublishEventType::ChannelPublishFailed)
                .count(),
            2
        );
        let final_post = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(final_post.status, PostStatus::Published);
    }
}
