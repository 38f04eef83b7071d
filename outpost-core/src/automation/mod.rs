//! Automation runtime — executes one queued `AutomationRun`.
//!
//! Dispatches on the rule's action: content generation (with guardrails
//! and the flag-gated AI quality policy), scheduling approved content,
//! immediate publishing, or metrics sync. Runs are terminal once finished;
//! cancellation is a KV flag checked between steps, and the whole run
//! executes under a deadline propagated to the generator.

pub mod generator;
pub mod guardrails;
pub mod quality;
pub mod template;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::clock::{Deadline, SharedClock};
use crate::config::AutomationConfig;
use crate::control::FeatureFlags;
use crate::error::{AutomationError, GenerationError};
use crate::events;
use crate::kv::{Kv, keys};
use crate::queue::{Job, JobQueue};
use crate::store::models::{
    AiQualityPolicy, AutomationRule, AutomationRun, Campaign, ContentItem, ContentSource,
    ContentStatus, ContentTemplate, PostStatus, RunStatus,
};
use crate::store::Store;
use crate::types::{ContentItemId, RunId, TemplateId, TenantId};

use generator::{GenerationRequest, RetryingGenerator, default_output_schema};

const DEFAULT_PROMPT: &str =
    "Write an engaging post about {{topic}} for {{brand.voice}} with the call to action {{offer}}.";
const POST_TEXT_TEMPLATE_TYPE: &str = "post_text";
const CANCEL_FLAG_TTL: Duration = Duration::from_secs(600);
/// Fallback delay for schedule_post when no publish_at is configured.
const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_secs(300);

/// Result of one `execute_run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run was not in a runnable state (terminal, or claimed by
    /// another worker).
    Skipped { reason: String },
    Completed { status: RunStatus },
}

/// Request cancellation of a queued or running automation run.
pub fn cancel_run(kv: &dyn Kv, run_id: RunId) {
    let _ = kv.set_ex(&keys::run_cancel(run_id), "1", CANCEL_FLAG_TTL);
}

pub struct AutomationRuntime {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
    clock: SharedClock,
    generator: RetryingGenerator,
    flags: FeatureFlags,
    publishing_queue: Arc<dyn JobQueue>,
    analytics_queue: Arc<dyn JobQueue>,
    config: AutomationConfig,
}

impl AutomationRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        clock: SharedClock,
        generator: RetryingGenerator,
        flags: FeatureFlags,
        publishing_queue: Arc<dyn JobQueue>,
        analytics_queue: Arc<dyn JobQueue>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            store,
            kv,
            clock,
            generator,
            flags,
            publishing_queue,
            analytics_queue,
            config,
        }
    }

    fn cancelled(&self, run_id: RunId) -> bool {
        self.kv
            .get(&keys::run_cancel(run_id))
            .ok()
            .flatten()
            .is_some()
    }

    /// Execute one queued run to a terminal state.
    pub async fn execute_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<RunOutcome, AutomationError> {
        let now = self.clock.now();
        let Some(run) = self.store.automation_run(tenant_id, run_id)? else {
            return Err(AutomationError::RunNotFound {
                run_id: run_id.to_string(),
            });
        };
        if run.status.is_terminal() {
            return Ok(RunOutcome::Skipped {
                reason: "terminal_state".to_string(),
            });
        }

        let Some(rule) =
            self.store
                .automation_rule(tenant_id, run.project_id, run.rule_id)?
        else {
            let stats = json!({ "error": "rule_not_found" });
            self.finish(&run, RunStatus::Failed, stats).await?;
            return Ok(RunOutcome::Completed {
                status: RunStatus::Failed,
            });
        };

        let started_event = events::run_started(&run, rule.id, rule.action.as_str(), now);
        if !self.store.start_run(tenant_id, run_id, now, &started_event)? {
            return Ok(RunOutcome::Skipped {
                reason: "already_claimed".to_string(),
            });
        }
        info!(
            %tenant_id,
            run_id = %run.id,
            rule_id = %rule.id,
            action = rule.action.as_str(),
            "automation run started"
        );

        if self.cancelled(run_id) {
            let stats = json!({ "cancelled": true });
            self.finish(&run, RunStatus::Failed, stats).await?;
            return Ok(RunOutcome::Completed {
                status: RunStatus::Failed,
            });
        }

        let deadline = Deadline::after(
            self.clock.as_ref(),
            Duration::from_secs(self.config.run_timeout_secs),
        );
        let action_result = match rule.action {
            crate::store::models::ActionKind::GeneratePost => {
                self.action_generate_post(&run, &rule, &deadline).await
            }
            crate::store::models::ActionKind::SchedulePost => {
                self.action_schedule_post(&run, &rule).await
            }
            crate::store::models::ActionKind::PublishNow => {
                self.action_publish_now(&run, &rule).await
            }
            crate::store::models::ActionKind::SyncMetrics => self.action_sync_metrics(&run).await,
        };

        match action_result {
            Ok((stats, partial)) => {
                let status = if partial {
                    RunStatus::Partial
                } else {
                    RunStatus::Success
                };
                let merged = merge_stats(&run.stats, &stats);
                self.finish(&run, status, merged).await?;
                Ok(RunOutcome::Completed { status })
            }
            Err(err) => {
                warn!(%tenant_id, run_id = %run.id, error = %err, "automation run failed");
                let merged = merge_stats(&run.stats, &json!({ "error": err.to_string() }));
                self.finish(&run, RunStatus::Failed, merged).await?;
                Ok(RunOutcome::Completed {
                    status: RunStatus::Failed,
                })
            }
        }
    }

    async fn finish(
        &self,
        run: &AutomationRun,
        status: RunStatus,
        stats: Value,
    ) -> Result<(), AutomationError> {
        let now = self.clock.now();
        let event = events::run_completed(run, status, stats.clone(), now);
        self.store
            .finish_run(run.tenant_id, run.id, status, &stats, now, &event)?;
        Ok(())
    }

    fn resolve_template(
        &self,
        run: &AutomationRun,
        rule: &AutomationRule,
    ) -> Result<Option<ContentTemplate>, AutomationError> {
        let Some(raw) = rule.action_config.get("template_id").and_then(Value::as_str) else {
            return Ok(None);
        };
        let Some(template_id) = TemplateId::parse(raw) else {
            return Ok(None);
        };
        let template = self
            .store
            .content_template(run.tenant_id, run.project_id, template_id)?;
        if let Some(template) = &template {
            if template.template_type != POST_TEXT_TEMPLATE_TYPE {
                return Err(AutomationError::UnsupportedTemplateType {
                    template_type: template.template_type.clone(),
                });
            }
        }
        Ok(template)
    }

    fn resolve_campaign(
        &self,
        run: &AutomationRun,
        rule: &AutomationRule,
    ) -> Result<Option<Campaign>, AutomationError> {
        let Some(campaign_id) = rule.campaign_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .campaign(run.tenant_id, run.project_id, campaign_id)?)
    }

    async fn action_generate_post(
        &self,
        run: &AutomationRun,
        rule: &AutomationRule,
        deadline: &Deadline,
    ) -> Result<(Value, bool), AutomationError> {
        let config = &rule.action_config;
        let template = self.resolve_template(run, rule)?;
        let campaign = self.resolve_campaign(run, rule)?;

        let prompt_template = template
            .as_ref()
            .map(|t| t.prompt_template.clone())
            .or_else(|| {
                config
                    .get("prompt_template")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string());
        let output_schema = template
            .as_ref()
            .and_then(|t| t.output_schema.clone())
            .unwrap_or_else(default_output_schema);
        let mut variables = template
            .as_ref()
            .map(|t| t.default_values.clone())
            .unwrap_or_else(|| json!({}));
        if let (Some(target), Some(overrides)) = (
            variables.as_object_mut(),
            config.get("variables").and_then(Value::as_object),
        ) {
            for (key, value) in overrides {
                target.insert(key.clone(), value.clone());
            }
        }
        let brand_profile = campaign
            .as_ref()
            .map(|c| c.brand_profile.clone())
            .unwrap_or_else(|| json!({}));
        let language = config
            .get("language")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| campaign.as_ref().and_then(|c| c.language.clone()))
            .unwrap_or_else(|| self.config.generator.default_language.clone());

        let request = GenerationRequest {
            prompt_template,
            output_schema,
            variables: variables.clone(),
            brand_profile,
            language,
        };

        let budget = deadline.remaining(self.clock.as_ref());
        let generated = match tokio::time::timeout(
            budget.max(Duration::from_secs(1)),
            self.generator.generate_validated(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Request {
                message: format!("generation timed out after {}s", budget.as_secs()),
            }),
        };

        let now = self.clock.now();
        let generated = match generated {
            Ok(payload) => payload,
            Err(err) => {
                let failed_item = ContentItem {
                    id: ContentItemId::new(),
                    tenant_id: run.tenant_id,
                    project_id: run.project_id,
                    campaign_id: rule.campaign_id,
                    template_id: template.as_ref().map(|t| t.id),
                    status: ContentStatus::Failed,
                    title: "AI generation failed".to_string(),
                    body: String::new(),
                    metadata: json!({
                        "generated_by_rule_id": rule.id.to_string(),
                        "error": err.to_string(),
                        "variables": variables,
                    }),
                    source: ContentSource::Ai,
                    created_at: now,
                };
                let failure_event =
                    events::content_generation_failed(run, failed_item.id, &err.to_string(), now);
                self.store
                    .insert_content_item(&failed_item, &[failure_event])?;
                return Err(err.into());
            }
        };

        let title = generated
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let body = generated
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let risk_flags: Vec<String> = generated
            .get("risk_flags")
            .and_then(Value::as_array)
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut requires_approval = rule.guardrails.approval_required;
        if risk_flags.iter().any(|flag| flag.to_lowercase() != "none") {
            requires_approval = true;
        }

        let violations =
            guardrails::check_guardrails(self.store.as_ref(), rule, now, Some(&title))
                .map_err(|e| AutomationError::Store(crate::error::StoreError::Backend {
                    message: e.to_string(),
                }))?;
        let mut status = if requires_approval || !violations.is_empty() {
            ContentStatus::NeedsReview
        } else {
            ContentStatus::Draft
        };

        let mut metadata = json!({
            "generated_by_rule_id": rule.id.to_string(),
            "guardrail_violations": violations,
            "channels": generated.get("channels").cloned().unwrap_or(json!([])),
            "hashtags": generated.get("hashtags").cloned().unwrap_or(json!([])),
            "cta": generated.get("cta").cloned().unwrap_or(Value::Null),
            "risk_flags": risk_flags,
            "ai_output": generated,
        });

        if self.flags.is_enabled("beta_ai_quality", Some(run.tenant_id)) {
            let policy_row = match self.store.quality_policy(run.tenant_id, run.project_id)? {
                Some(row) => row,
                None => {
                    let row = AiQualityPolicy {
                        tenant_id: run.tenant_id,
                        project_id: run.project_id,
                        policy: serde_json::to_value(quality::QualityPolicy::default())
                            .unwrap_or_else(|_| json!({})),
                        created_at: now,
                    };
                    self.store.upsert_quality_policy(&row)?;
                    row
                }
            };
            let policy = quality::QualityPolicy::from_json(&policy_row.policy);
            let evaluation = quality::evaluate_text(&body, Some(&title), &policy);
            metadata = quality::apply_quality_to_metadata(&metadata, &evaluation);
            status = quality::choose_content_status(status, &evaluation);
        }

        let item = ContentItem {
            id: ContentItemId::new(),
            tenant_id: run.tenant_id,
            project_id: run.project_id,
            campaign_id: rule.campaign_id,
            template_id: template.as_ref().map(|t| t.id),
            status,
            title,
            body,
            metadata,
            source: ContentSource::Ai,
            created_at: now,
        };

        let mut item_events = vec![events::content_generated(
            run,
            item.id,
            item.status.as_str(),
            now,
        )];
        if item.status == ContentStatus::NeedsReview {
            item_events.push(events::approval_required(run, item.id, now));
        }
        self.store.insert_content_item(&item, &item_events)?;
        info!(
            tenant_id = %run.tenant_id,
            run_id = %run.id,
            content_item_id = %item.id,
            status = item.status.as_str(),
            violations = violations.len(),
            "content generated"
        );

        let stats = json!({
            "generated_content_items": 1,
            "generated_content_item_ids": [item.id.to_string()],
            "guardrail_violations": violations,
        });
        Ok((stats, !violations.is_empty()))
    }

    async fn action_schedule_post(
        &self,
        run: &AutomationRun,
        rule: &AutomationRule,
    ) -> Result<(Value, bool), AutomationError> {
        let now = self.clock.now();
        let publish_at = rule
            .action_config
            .get("publish_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(|| {
                now + chrono::Duration::from_std(DEFAULT_SCHEDULE_DELAY).unwrap_or_default()
            });

        let candidates = self.store.content_items_by_status(
            run.tenant_id,
            run.project_id,
            &[ContentStatus::Approved, ContentStatus::Draft],
        )?;
        if candidates.is_empty() {
            return Ok((json!({ "scheduled_posts": 0 }), false));
        }

        let mut scheduled = 0u64;
        for item in &candidates {
            let title = if item.title.trim().is_empty() {
                "Automated post".to_string()
            } else {
                item.title.clone()
            };
            let post =
                crate::store::models::Post::new(run.tenant_id, run.project_id, title, &item.body, now)
                    .scheduled_at(publish_at);
            let mut event = events::post_scheduled(&post, "automation", now);
            if let Some(object) = event.metadata.as_object_mut() {
                object.insert("run_id".to_string(), json!(run.id.to_string()));
            }
            self.store.insert_post_with_event(&post, &event)?;
            self.store
                .set_content_item_status(run.tenant_id, item.id, ContentStatus::Scheduled)?;
            scheduled += 1;
        }

        self.store
            .append_automation_event(&events::posts_scheduled(run, scheduled, now))?;
        Ok((json!({ "scheduled_posts": scheduled }), false))
    }

    async fn action_publish_now(
        &self,
        run: &AutomationRun,
        rule: &AutomationRule,
    ) -> Result<(Value, bool), AutomationError> {
        let now = self.clock.now();
        let limit = rule
            .action_config
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .max(1) as usize;

        let posts = self.store.posts_by_status(
            run.tenant_id,
            run.project_id,
            &[PostStatus::Draft, PostStatus::Scheduled],
            limit,
        )?;

        let mut enqueued = 0u64;
        for post in &posts {
            let mut event = events::post_scheduled(post, "automation_publish_now", now);
            if let Some(object) = event.metadata.as_object_mut() {
                object.insert("run_id".to_string(), json!(run.id.to_string()));
            }
            let scheduled = self.store.schedule_post(
                run.tenant_id,
                post.id,
                now,
                &[PostStatus::Draft, PostStatus::Scheduled],
                &event,
            )?;
            if !scheduled {
                continue;
            }
            if let Err(err) = self.publishing_queue.enqueue(Job::Publish {
                tenant_id: run.tenant_id,
                post_id: post.id,
                attempt: 1,
            }) {
                warn!(post_id = %post.id, error = %err, "publish_now enqueue failed");
                continue;
            }
            enqueued += 1;
        }

        self.store
            .append_automation_event(&events::publish_enqueued(run, enqueued, now))?;
        Ok((json!({ "enqueued_posts": enqueued }), false))
    }

    async fn action_sync_metrics(&self, run: &AutomationRun) -> Result<(Value, bool), AutomationError> {
        let now = self.clock.now();
        self.store
            .append_automation_event(&events::metrics_sync_queued(run, now))?;
        if let Err(err) = self.analytics_queue.enqueue(Job::MetricsSync {
            tenant_id: run.tenant_id,
        }) {
            warn!(run_id = %run.id, error = %err, "metrics sync enqueue failed");
        }
        Ok((json!({ "sync_metrics": "queued" }), false))
    }
}

fn merge_stats(base: &Value, extra: &Value) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_else(Map::new);
    if let Some(extra) = extra.as_object() {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::generator::MockGenerator;
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::kv::MemoryKv;
    use crate::queue::{MemoryQueue, QUEUE_ANALYTICS, QUEUE_PUBLISHING};
    use crate::store::models::{
        ActionKind, Guardrails, Project, QuietHours, Tenant, TriggerKind,
    };
    use crate::store::MemoryStore;
    use crate::types::{ProjectId, RuleId};
    use chrono::TimeZone;

    struct Fixture {
        runtime: AutomationRuntime,
        store: Arc<MemoryStore>,
        kv: Arc<MemoryKv>,
        clock: Arc<ManualClock>,
        publishing: Arc<MemoryQueue>,
        tenant_id: TenantId,
        project_id: ProjectId,
    }

    fn fixture_with_generator(mock: MockGenerator) -> Fixture {
        // 23:30 UTC so quiet-hour guardrail tests have a late-night clock.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let publishing = Arc::new(MemoryQueue::new(QUEUE_PUBLISHING, clock.clone(), kv.clone()));
        let analytics = Arc::new(MemoryQueue::new(QUEUE_ANALYTICS, clock.clone(), kv.clone()));
        let flags = FeatureFlags::new(store.clone(), kv.clone(), Duration::from_secs(30));
        let runtime = AutomationRuntime::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            RetryingGenerator::new(Arc::new(mock), 2),
            flags,
            publishing.clone(),
            analytics,
            AutomationConfig::default(),
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
            runtime,
            store,
            kv,
            clock,
            publishing,
            tenant_id,
            project_id,
        }
    }

    fn insert_rule(fixture: &Fixture, action: ActionKind, guardrails: Guardrails) -> AutomationRule {
        let rule = AutomationRule {
            id: RuleId::new(),
            tenant_id: fixture.tenant_id,
            project_id: fixture.project_id,
            name: "rule".into(),
            trigger: TriggerKind::Cron,
            trigger_config: json!({ "cron": "*/30 * * * *" }),
            action,
            action_config: json!({}),
            guardrails,
            campaign_id: None,
            is_enabled: true,
            created_at: fixture.clock.now(),
        };
        fixture.store.insert_automation_rule(&rule).unwrap();
        rule
    }

    fn queue_run(fixture: &Fixture, rule: &AutomationRule) -> AutomationRun {
        let run = AutomationRun {
            id: RunId::new(),
            tenant_id: rule.tenant_id,
            project_id: rule.project_id,
            rule_id: rule.id,
            status: RunStatus::Queued,
            stats: json!({ "trigger_reason": "time_trigger" }),
            started_at: None,
            finished_at: None,
            created_at: fixture.clock.now(),
        };
        let event = events::run_queued(&run, rule.id, "time_trigger", json!({}), fixture.clock.now());
        assert!(fixture
            .store
            .create_run_if_no_recent(&run, &event, Duration::from_secs(300))
            .unwrap());
        run
    }

    #[tokio::test]
    async fn test_generate_post_success_creates_draft() {
        let fixture = fixture_with_generator(
            MockGenerator::new().then_ok(MockGenerator::valid_payload("Fresh announcement")),
        );
        let rule = insert_rule(&fixture, ActionKind::GeneratePost, Guardrails::default());
        let run = queue_run(&fixture, &rule);

        let outcome = fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { status: RunStatus::Success });

        let items = fixture
            .store
            .content_items_by_status(fixture.tenant_id, fixture.project_id, &[ContentStatus::Draft])
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Fresh announcement");
        assert_eq!(items[0].source, ContentSource::Ai);

        let trail = fixture
            .store
            .automation_events_for_run(fixture.tenant_id, run.id)
            .unwrap();
        let kinds: Vec<_> = trail.iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&crate::store::models::AutomationEventType::AutomationRunQueued));
        assert!(kinds.contains(&crate::store::models::AutomationEventType::AutomationRunStarted));
        assert!(kinds.contains(&crate::store::models::AutomationEventType::ContentGenerated));
        assert!(kinds.contains(&crate::store::models::AutomationEventType::AutomationRunCompleted));
    }

    #[tokio::test]
    async fn test_generate_post_quiet_hours_needs_review() {
        let fixture = fixture_with_generator(
            MockGenerator::new().then_ok(MockGenerator::valid_payload("Night owl post")),
        );
        // Clock is at 23:30, inside the quiet window.
        let rule = insert_rule(
            &fixture,
            ActionKind::GeneratePost,
            Guardrails {
                quiet_hours: Some(QuietHours {
                    start: "22:00".into(),
                    end: "06:00".into(),
                }),
                ..Default::default()
            },
        );
        let run = queue_run(&fixture, &rule);

        let outcome = fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { status: RunStatus::Partial });

        let items = fixture
            .store
            .content_items_by_status(
                fixture.tenant_id,
                fixture.project_id,
                &[ContentStatus::NeedsReview],
            )
            .unwrap();
        assert_eq!(items.len(), 1);
        let violations = items[0].metadata["guardrail_violations"]
            .as_array()
            .unwrap()
            .clone();
        assert!(violations.contains(&json!("quiet_hours")));

        let trail = fixture
            .store
            .automation_events_for_run(fixture.tenant_id, run.id)
            .unwrap();
        assert!(trail
            .iter()
            .any(|e| e.event_type == crate::store::models::AutomationEventType::ApprovalRequired));
    }

    #[tokio::test]
    async fn test_generate_post_risk_flags_force_review() {
        let mut payload = MockGenerator::valid_payload("Edgy take");
        payload["risk_flags"] = json!(["political"]);
        let fixture = fixture_with_generator(MockGenerator::new().then_ok(payload));
        let rule = insert_rule(&fixture, ActionKind::GeneratePost, Guardrails::default());
        let run = queue_run(&fixture, &rule);

        fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();

        let items = fixture
            .store
            .content_items_by_status(
                fixture.tenant_id,
                fixture.project_id,
                &[ContentStatus::NeedsReview],
            )
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_records_failed_item() {
        let fixture = fixture_with_generator(MockGenerator::new().then_err("model unavailable"));
        let rule = insert_rule(&fixture, ActionKind::GeneratePost, Guardrails::default());
        let run = queue_run(&fixture, &rule);

        let outcome = fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { status: RunStatus::Failed });

        let failed_items = fixture
            .store
            .content_items_by_status(fixture.tenant_id, fixture.project_id, &[ContentStatus::Failed])
            .unwrap();
        assert_eq!(failed_items.len(), 1);
        assert_eq!(failed_items[0].title, "AI generation failed");

        let trail = fixture
            .store
            .automation_events_for_run(fixture.tenant_id, run.id)
            .unwrap();
        assert!(trail.iter().any(|e| {
            e.event_type == crate::store::models::AutomationEventType::ContentGenerationFailed
        }));

        let reloaded = fixture
            .store
            .automation_run(fixture.tenant_id, run.id)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
        assert!(reloaded.stats["error"].as_str().unwrap().contains("model unavailable"));
    }

    #[tokio::test]
    async fn test_schedule_post_materializes_approved_content() {
        let fixture = fixture_with_generator(MockGenerator::new());
        let rule = insert_rule(&fixture, ActionKind::SchedulePost, Guardrails::default());

        fixture
            .store
            .insert_content_item(
                &ContentItem {
                    id: ContentItemId::new(),
                    tenant_id: fixture.tenant_id,
                    project_id: fixture.project_id,
                    campaign_id: None,
                    template_id: None,
                    status: ContentStatus::Approved,
                    title: "Approved idea".into(),
                    body: "The body".into(),
                    metadata: json!({}),
                    source: ContentSource::Ai,
                    created_at: fixture.clock.now(),
                },
                &[],
            )
            .unwrap();

        let run = queue_run(&fixture, &rule);
        let outcome = fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { status: RunStatus::Success });

        let scheduled = fixture
            .store
            .posts_by_status(
                fixture.tenant_id,
                fixture.project_id,
                &[PostStatus::Scheduled],
                10,
            )
            .unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].title, "Approved idea");
        // Default publish_at lands five minutes out.
        let publish_at = scheduled[0].publish_at.unwrap();
        assert_eq!(publish_at, fixture.clock.now() + chrono::Duration::minutes(5));

        // The content item moved to scheduled.
        let items = fixture
            .store
            .content_items_by_status(
                fixture.tenant_id,
                fixture.project_id,
                &[ContentStatus::Scheduled],
            )
            .unwrap();
        assert_eq!(items.len(), 1);

        let reloaded = fixture
            .store
            .automation_run(fixture.tenant_id, run.id)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.stats["scheduled_posts"], 1);
    }

    #[tokio::test]
    async fn test_publish_now_enqueues_jobs() {
        let fixture = fixture_with_generator(MockGenerator::new());
        let rule = insert_rule(&fixture, ActionKind::PublishNow, Guardrails::default());

        let draft = crate::store::models::Post::new(
            fixture.tenant_id,
            fixture.project_id,
            "Draft post",
            "Body",
            fixture.clock.now(),
        );
        fixture.store.insert_post(&draft).unwrap();

        let run = queue_run(&fixture, &rule);
        fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();

        let job = fixture
            .publishing
            .pop_ready(fixture.clock.now())
            .unwrap()
            .unwrap();
        assert_eq!(
            job,
            Job::Publish {
                tenant_id: fixture.tenant_id,
                post_id: draft.id,
                attempt: 1
            }
        );

        let reloaded = fixture.store.post(fixture.tenant_id, draft.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Scheduled);
        assert_eq!(reloaded.publish_at, Some(fixture.clock.now()));
    }

    #[tokio::test]
    async fn test_sync_metrics_emits_event() {
        let fixture = fixture_with_generator(MockGenerator::new());
        let rule = insert_rule(&fixture, ActionKind::SyncMetrics, Guardrails::default());
        let run = queue_run(&fixture, &rule);

        fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        let trail = fixture
            .store
            .automation_events_for_run(fixture.tenant_id, run.id)
            .unwrap();
        assert!(trail
            .iter()
            .any(|e| e.event_type == crate::store::models::AutomationEventType::MetricsSyncQueued));
    }

    #[tokio::test]
    async fn test_terminal_run_is_skipped() {
        let fixture = fixture_with_generator(MockGenerator::new());
        let rule = insert_rule(&fixture, ActionKind::SyncMetrics, Guardrails::default());
        let run = queue_run(&fixture, &rule);

        fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        let outcome = fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Skipped {
                reason: "terminal_state".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancellation_flag_fails_run() {
        let fixture = fixture_with_generator(
            MockGenerator::new().then_ok(MockGenerator::valid_payload("Never happens")),
        );
        let rule = insert_rule(&fixture, ActionKind::GeneratePost, Guardrails::default());
        let run = queue_run(&fixture, &rule);

        cancel_run(fixture.kv.as_ref(), run.id);
        let outcome = fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed { status: RunStatus::Failed });

        let reloaded = fixture
            .store
            .automation_run(fixture.tenant_id, run.id)
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.stats["cancelled"], true);
        // No content was generated.
        let items = fixture
            .store
            .content_items_since(fixture.tenant_id, fixture.clock.now() - chrono::Duration::hours(1))
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_ai_quality_gate_when_flag_enabled() {
        let mut payload = MockGenerator::valid_payload("LOUD TITLE");
        let spam_tags: Vec<String> = (0..13).map(|i| format!("#deal{i}")).collect();
        payload["body"] = json!(format!(
            "BUY NOW!!!!! THIS IS ABSOLUTELY THE GREATEST PRODUCT EVER MADE AND YOU MUST NOT MISS IT!!!!! {}",
            spam_tags.join(" ")
        ));
        let fixture = fixture_with_generator(MockGenerator::new().then_ok(payload));

        // Enable the quality flag for this tenant.
        let mut flag = crate::store::models::FeatureFlag {
            key: "beta_ai_quality".into(),
            enabled_globally: false,
            enabled_per_tenant: Default::default(),
            description: String::new(),
            updated_at: fixture.clock.now(),
        };
        flag.enabled_per_tenant
            .insert(fixture.tenant_id.to_string(), true);
        fixture.store.upsert_feature_flag(&flag).unwrap();

        let rule = insert_rule(&fixture, ActionKind::GeneratePost, Guardrails::default());
        let run = queue_run(&fixture, &rule);
        fixture
            .runtime
            .execute_run(fixture.tenant_id, run.id)
            .await
            .unwrap();

        let items = fixture
            .store
            .content_items_by_status(
                fixture.tenant_id,
                fixture.project_id,
                &[ContentStatus::NeedsReview],
            )
            .unwrap();
        assert_eq!(items.len(), 1);
        let quality = &items[0].metadata["quality"];
        assert!(quality["risk_score"].as_f64().unwrap() >= 0.65);
        assert!(quality["risk_flags"]
            .as_array()
            .unwrap()
            .contains(&json!("shouting_style")));

        // A default policy row was created for the project.
        assert!(fixture
            .store
            .quality_policy(fixture.tenant_id, fixture.project_id)
            .unwrap()
            .is_some());
    }
}
