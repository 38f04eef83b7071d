//! Scheduler — periodic beats that feed the work queues.
//!
//! Three passes: due-post dispatch, time-rule dispatch (cron + interval),
//! and event-rule dispatch driven by the publish-event cursor. Each pass is
//! idempotent: due posts are claimed with a status CAS, runs are gated by
//! the minute-bucket fingerprint and the recent-run window, so overlapping
//! scheduler instances cannot double-dispatch.

pub mod events;
pub mod heartbeat;
pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{SharedClock, jitter};
use crate::config::BeatsConfig;
use crate::error::SchedulerError;
use crate::events as event_log;
use crate::kv::{Kv, keys};
use crate::queue::{Job, JobQueue};
use crate::store::models::{AutomationRule, AutomationRun, RunStatus, TriggerKind};
use crate::store::Store;
use crate::types::RunId;

pub use heartbeat::Heartbeat;

/// How many due posts one pass will claim.
const DUE_POST_BATCH: usize = 100;
/// How many publish events one event-rule pass will consume.
const EVENT_BATCH: usize = 500;
/// Recent-run suppression window for the anti-stampede check.
const RECENT_RUN_WINDOW: Duration = Duration::from_secs(300);
/// TTL on the fingerprint key; outlives the minute bucket it names.
const FINGERPRINT_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DuePostStats {
    pub claimed: usize,
    pub enqueued: usize,
    pub reverted: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuleDispatchStats {
    pub rules_checked: usize,
    pub runs_created: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
    clock: SharedClock,
    publishing_queue: Arc<dyn JobQueue>,
    scheduler_queue: Arc<dyn JobQueue>,
    beats: BeatsConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        clock: SharedClock,
        publishing_queue: Arc<dyn JobQueue>,
        scheduler_queue: Arc<dyn JobQueue>,
        beats: BeatsConfig,
    ) -> Self {
        Self {
            store,
            kv,
            clock,
            publishing_queue,
            scheduler_queue,
            beats,
        }
    }

    /// Claim due posts and hand them to the publishing queue. The claim
    /// commits before the enqueue; an enqueue that keeps failing reverts
    /// the post so the next pass retries it.
    pub fn dispatch_due_posts(&self) -> Result<DuePostStats, SchedulerError> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let claimed = self.store.platform_claim_due_posts(now, DUE_POST_BATCH)?;
        let mut stats = DuePostStats {
            claimed: claimed.len(),
            ..Default::default()
        };

        for post in &claimed {
            let job = Job::Publish {
                tenant_id: post.tenant_id,
                post_id: post.id,
                attempt: 1,
            };
            let enqueued = self
                .publishing_queue
                .enqueue(job.clone())
                .or_else(|_| self.publishing_queue.enqueue(job));
            match enqueued {
                Ok(()) => stats.enqueued += 1,
                Err(err) => {
                    warn!(
                        tenant_id = %post.tenant_id,
                        post_id = %post.id,
                        error = %err,
                        "enqueue failed, reverting post to scheduled"
                    );
                    self.store.revert_post_to_scheduled(
                        post.tenant_id,
                        post.id,
                        "publish enqueue failed",
                        now,
                    )?;
                    stats.reverted += 1;
                }
            }
        }

        self.record_scan_sample(started.elapsed());
        if stats.claimed > 0 {
            info!(claimed = stats.claimed, enqueued = stats.enqueued, "due-post pass complete");
        }
        Ok(stats)
    }

    /// Evaluate enabled cron/interval rules and queue a run per due rule.
    pub fn dispatch_time_rules(&self) -> Result<RuleDispatchStats, SchedulerError> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let rules = self
            .store
            .platform_enabled_rules(&[TriggerKind::Cron, TriggerKind::Interval])?;
        let mut stats = RuleDispatchStats {
            rules_checked: rules.len(),
            ..Default::default()
        };

        for rule in &rules {
            let last_run =
                self.store
                    .latest_run_created_at(rule.tenant_id, rule.project_id, rule.id)?;
            if !rules::rule_due(rule, last_run, now) {
                continue;
            }
            if self.queue_rule_run(
                rule,
                "time_trigger",
                json!({ "trigger_type": rule.trigger.as_str() }),
            )? {
                stats.runs_created += 1;
            }
        }

        self.record_scan_sample(started.elapsed());
        Ok(stats)
    }

    /// Consume publish events after the cursor and queue runs for matching
    /// event rules, then advance the cursor.
    pub fn dispatch_event_rules(&self) -> Result<RuleDispatchStats, SchedulerError> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let cursor_raw = self.kv.get(keys::EVENT_RULE_CURSOR).unwrap_or(None);
        let cursor = events::parse_cursor(cursor_raw, now);

        let publish_events = self
            .store
            .platform_publish_events_after(cursor, EVENT_BATCH)?;
        if publish_events.is_empty() {
            self.record_scan_sample(started.elapsed());
            return Ok(RuleDispatchStats::default());
        }

        let rules = self.store.platform_enabled_rules(&[TriggerKind::Event])?;
        let mut stats = RuleDispatchStats {
            rules_checked: rules.len(),
            ..Default::default()
        };

        for event in &publish_events {
            for rule in &rules {
                if !events::event_matches_rule(rule, event) {
                    continue;
                }
                if self.queue_rule_run(
                    rule,
                    "event_trigger",
                    json!({
                        "trigger_event_id": event.id.to_string(),
                        "publish_event_type": event.event_type.as_str(),
                        "publish_event_status": event.status.as_str(),
                    }),
                )? {
                    stats.runs_created += 1;
                }
            }
        }

        let latest = publish_events
            .last()
            .map(|e| e.created_at)
            .unwrap_or(cursor);
        if let Err(err) = self.kv.set(keys::EVENT_RULE_CURSOR, &latest.to_rfc3339()) {
            warn!(error = %err, "failed to advance event-rule cursor");
        }

        self.record_scan_sample(started.elapsed());
        Ok(stats)
    }

    /// Create and enqueue a run for `rule` unless the anti-stampede gates
    /// (minute fingerprint, recent-run window) suppress it.
    fn queue_rule_run(
        &self,
        rule: &AutomationRule,
        trigger_reason: &str,
        trigger_metadata: serde_json::Value,
    ) -> Result<bool, SchedulerError> {
        let now = self.clock.now();
        let fingerprint = rules::rule_fingerprint(rule.id, rule.trigger, now);

        // Cheap cross-instance gate; KV errors fall through to the
        // recent-run check inside the run-creation transaction.
        let fingerprint_key = format!("automation:rule_fp:{fingerprint}");
        if let Ok(false) = self.kv.set_nx_ex(&fingerprint_key, "1", FINGERPRINT_TTL) {
            return Ok(false);
        }

        let run = AutomationRun {
            id: RunId::new(),
            tenant_id: rule.tenant_id,
            project_id: rule.project_id,
            rule_id: rule.id,
            status: RunStatus::Queued,
            stats: json!({
                "trigger_reason": trigger_reason,
                "triggered_at": now.to_rfc3339(),
                "rule_fingerprint": fingerprint,
            }),
            started_at: None,
            finished_at: None,
            created_at: now,
        };
        let event = event_log::run_queued(&run, rule.id, trigger_reason, trigger_metadata, now);
        let created = self
            .store
            .create_run_if_no_recent(&run, &event, RECENT_RUN_WINDOW)?;
        if !created {
            return Ok(false);
        }

        if let Err(err) = self.scheduler_queue.enqueue(Job::Automation {
            tenant_id: run.tenant_id,
            run_id: run.id,
        }) {
            warn!(run_id = %run.id, error = %err, "failed to enqueue automation run");
        }
        info!(
            tenant_id = %rule.tenant_id,
            rule_id = %rule.id,
            run_id = %run.id,
            trigger_reason,
            "automation run queued"
        );
        Ok(true)
    }

    fn record_scan_sample(&self, elapsed: Duration) {
        let _ = self.kv.list_push_trim(
            &keys::perf_samples("scheduler_scan_duration_ms"),
            &format!("{:.3}", elapsed.as_secs_f64() * 1000.0),
            500,
        );
    }

    /// Drive the three beat loops until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let due_posts = {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            let beat = Duration::from_secs(self.beats.due_posts_secs);
            let frac = self.beats.jitter_frac;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(jitter(beat, frac)) => {
                            if let Err(err) = scheduler.dispatch_due_posts() {
                                warn!(error = %err, "due-post pass failed");
                            }
                        }
                    }
                }
            })
        };
        let time_rules = {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            let beat = Duration::from_secs(self.beats.time_rules_secs);
            let frac = self.beats.jitter_frac;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(jitter(beat, frac)) => {
                            if let Err(err) = scheduler.dispatch_time_rules() {
                                warn!(error = %err, "time-rule pass failed");
                            }
                        }
                    }
                }
            })
        };
        let event_rules = {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            let beat = Duration::from_secs(self.beats.event_rules_secs);
            let frac = self.beats.jitter_frac;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(jitter(beat, frac)) => {
                            if let Err(err) = scheduler.dispatch_event_rules() {
                                warn!(error = %err, "event-rule pass failed");
                            }
                        }
                    }
                }
            })
        };

        let _ = tokio::join!(due_posts, time_rules, event_rules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::kv::MemoryKv;
    use crate::queue::{MemoryQueue, QUEUE_PUBLISHING, QUEUE_SCHEDULER};
    use crate::store::models::{
        ActionKind, Guardrails, Post, PostStatus, Project, Tenant,
    };
    use crate::store::MemoryStore;
    use crate::types::{ProjectId, RuleId, TenantId};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        publishing: Arc<MemoryQueue>,
        scheduler_queue: Arc<MemoryQueue>,
        tenant_id: TenantId,
        project_id: ProjectId,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let publishing = Arc::new(MemoryQueue::new(QUEUE_PUBLISHING, clock.clone(), kv.clone()));
        let scheduler_queue = Arc::new(MemoryQueue::new(QUEUE_SCHEDULER, clock.clone(), kv.clone()));
        let scheduler = Scheduler::new(
            store.clone(),
            kv,
            clock.clone(),
            publishing.clone(),
            scheduler_queue.clone(),
            BeatsConfig::default(),
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
            scheduler,
            store,
            clock,
            publishing,
            scheduler_queue,
            tenant_id,
            project_id,
        }
    }

    fn cron_rule(fixture: &Fixture, expression: &str) -> AutomationRule {
        let rule = AutomationRule {
            id: RuleId::new(),
            tenant_id: fixture.tenant_id,
            project_id: fixture.project_id,
            name: "generate every 30m".into(),
            trigger: TriggerKind::Cron,
            trigger_config: json!({ "cron": expression }),
            action: ActionKind::GeneratePost,
            action_config: json!({}),
            guardrails: Guardrails::default(),
            campaign_id: None,
            is_enabled: true,
            created_at: fixture.clock.now(),
        };
        fixture.store.insert_automation_rule(&rule).unwrap();
        rule
    }

    #[test]
    fn test_due_posts_dispatched_once() {
        let fixture = fixture();
        let post = Post::new(fixture.tenant_id, fixture.project_id, "T", "C", fixture.clock.now())
            .scheduled_at(fixture.clock.now());
        fixture.store.insert_post(&post).unwrap();

        let stats = fixture.scheduler.dispatch_due_posts().unwrap();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.enqueued, 1);

        // Post now publishing, a second pass claims nothing.
        let reloaded = fixture.store.post(fixture.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Publishing);
        let second = fixture.scheduler.dispatch_due_posts().unwrap();
        assert_eq!(second.claimed, 0);

        let job = fixture.publishing.pop_ready(fixture.clock.now()).unwrap().unwrap();
        assert_eq!(
            job,
            Job::Publish {
                tenant_id: fixture.tenant_id,
                post_id: post.id,
                attempt: 1
            }
        );
    }

    #[test]
    fn test_future_posts_not_claimed() {
        let fixture = fixture();
        let post = Post::new(fixture.tenant_id, fixture.project_id, "T", "C", fixture.clock.now())
            .scheduled_at(fixture.clock.now() + chrono::Duration::minutes(10));
        fixture.store.insert_post(&post).unwrap();

        let stats = fixture.scheduler.dispatch_due_posts().unwrap();
        assert_eq!(stats.claimed, 0);

        fixture.clock.advance(Duration::from_secs(601));
        let stats = fixture.scheduler.dispatch_due_posts().unwrap();
        assert_eq!(stats.claimed, 1);
    }

    #[test]
    fn test_time_rule_anti_stampede_same_minute() {
        let fixture = fixture();
        cron_rule(&fixture, "*/30 * * * *");

        let first = fixture.scheduler.dispatch_time_rules().unwrap();
        assert_eq!(first.runs_created, 1);

        // Same minute, second pass: fingerprint + recent-run suppress it.
        fixture.clock.advance(Duration::from_secs(10));
        let second = fixture.scheduler.dispatch_time_rules().unwrap();
        assert_eq!(second.runs_created, 0);

        assert!(fixture.scheduler_queue.pop_ready(fixture.clock.now()).unwrap().is_some());
        assert!(fixture.scheduler_queue.pop_ready(fixture.clock.now()).unwrap().is_none());
    }

    #[test]
    fn test_interval_rule_fires_after_interval() {
        let fixture = fixture();
        let rule = AutomationRule {
            id: RuleId::new(),
            tenant_id: fixture.tenant_id,
            project_id: fixture.project_id,
            name: "every 10 minutes".into(),
            trigger: TriggerKind::Interval,
            trigger_config: json!({ "interval_seconds": 600 }),
            action: ActionKind::PublishNow,
            action_config: json!({}),
            guardrails: Guardrails::default(),
            campaign_id: None,
            is_enabled: true,
            created_at: fixture.clock.now(),
        };
        fixture.store.insert_automation_rule(&rule).unwrap();

        assert_eq!(fixture.scheduler.dispatch_time_rules().unwrap().runs_created, 1);

        // Not due again until the interval elapses past the last run.
        fixture.clock.advance(Duration::from_secs(360));
        assert_eq!(fixture.scheduler.dispatch_time_rules().unwrap().runs_created, 0);

        fixture.clock.advance(Duration::from_secs(241));
        assert_eq!(fixture.scheduler.dispatch_time_rules().unwrap().runs_created, 1);
    }

    #[test]
    fn test_event_rules_follow_cursor() {
        let fixture = fixture();
        let rule = AutomationRule {
            id: RuleId::new(),
            tenant_id: fixture.tenant_id,
            project_id: fixture.project_id,
            name: "react to failures".into(),
            trigger: TriggerKind::Event,
            trigger_config: json!({ "event_types": ["PostPublishFailed"] }),
            action: ActionKind::GeneratePost,
            action_config: json!({}),
            guardrails: Guardrails::default(),
            campaign_id: None,
            is_enabled: true,
            created_at: fixture.clock.now(),
        };
        fixture.store.insert_automation_rule(&rule).unwrap();

        let post = Post::new(fixture.tenant_id, fixture.project_id, "T", "C", fixture.clock.now());
        fixture.store.insert_post(&post).unwrap();
        fixture.clock.advance(Duration::from_secs(30));
        fixture
            .store
            .append_publish_event(&crate::events::post_publish_failed(
                &post,
                1,
                json!({}),
                fixture.clock.now(),
            ))
            .unwrap();

        let stats = fixture.scheduler.dispatch_event_rules().unwrap();
        assert_eq!(stats.runs_created, 1);

        // The cursor advanced past the consumed event; re-running the pass
        // does not dispatch the same event again.
        fixture.clock.advance(Duration::from_secs(120));
        let again = fixture.scheduler.dispatch_event_rules().unwrap();
        assert_eq!(again.runs_created, 0);
    }

    #[test]
    fn test_event_rules_ignore_unmatched_events() {
        let fixture = fixture();
        let rule = AutomationRule {
            id: RuleId::new(),
            tenant_id: fixture.tenant_id,
            project_id: fixture.project_id,
            name: "react to failures".into(),
            trigger: TriggerKind::Event,
            trigger_config: json!({ "event_types": ["PostPublishFailed"] }),
            action: ActionKind::GeneratePost,
            action_config: json!({}),
            guardrails: Guardrails::default(),
            campaign_id: None,
            is_enabled: true,
            created_at: fixture.clock.now(),
        };
        fixture.store.insert_automation_rule(&rule).unwrap();

        let post = Post::new(fixture.tenant_id, fixture.project_id, "T", "C", fixture.clock.now());
        fixture.store.insert_post(&post).unwrap();
        fixture.clock.advance(Duration::from_secs(30));
        fixture
            .store
            .append_publish_event(&crate::events::post_published(
                &post,
                1,
                json!({}),
                fixture.clock.now(),
            ))
            .unwrap();

        let stats = fixture.scheduler.dispatch_event_rules().unwrap();
        assert_eq!(stats.runs_created, 0);
    }
}
