//! Event constructors for the append-only publish and automation logs.
//!
//! Events are only ever written inside the same store transaction as the
//! state transition they describe, so constructors here are pure: they
//! build the row, the store persists it.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::store::models::{
    AutomationEvent, AutomationEventType, AutomationRun, EventStatus, Post, PublishEvent,
    PublishEventType, RunStatus,
};
use crate::types::{ChannelId, ContentItemId, EventId, RuleId};

fn base_publish_event(
    post: &Post,
    event_type: PublishEventType,
    status: EventStatus,
    attempt: u32,
    channel_id: Option<ChannelId>,
    metadata: Value,
    now: DateTime<Utc>,
) -> PublishEvent {
    PublishEvent {
        id: EventId::new(),
        tenant_id: post.tenant_id,
        project_id: post.project_id,
        post_id: post.id,
        channel_id,
        event_type,
        status,
        attempt,
        metadata,
        created_at: now,
    }
}

pub fn post_scheduled(post: &Post, source: &str, now: DateTime<Utc>) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::PostScheduled,
        EventStatus::Ok,
        1,
        None,
        json!({ "source": source }),
        now,
    )
}

pub fn publishing_started(post: &Post, source: &str, now: DateTime<Utc>) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::PostPublishingStarted,
        EventStatus::Ok,
        1,
        None,
        json!({ "source": source }),
        now,
    )
}

pub fn publish_now_requested(post: &Post, requested_by: &str, now: DateTime<Utc>) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::PublishNowRequested,
        EventStatus::Ok,
        1,
        None,
        json!({ "requested_by": requested_by }),
        now,
    )
}

pub fn channel_succeeded(
    post: &Post,
    channel_id: ChannelId,
    attempt: u32,
    metadata: Value,
    now: DateTime<Utc>,
) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::ChannelPublishSucceeded,
        EventStatus::Ok,
        attempt,
        Some(channel_id),
        metadata,
        now,
    )
}

pub fn channel_failed(
    post: &Post,
    channel_id: ChannelId,
    attempt: u32,
    metadata: Value,
    now: DateTime<Utc>,
) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::ChannelPublishFailed,
        EventStatus::Error,
        attempt,
        Some(channel_id),
        metadata,
        now,
    )
}

pub fn post_published(post: &Post, attempt: u32, metadata: Value, now: DateTime<Utc>) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::PostPublished,
        EventStatus::Ok,
        attempt,
        None,
        metadata,
        now,
    )
}

pub fn post_published_partial(
    post: &Post,
    attempt: u32,
    metadata: Value,
    now: DateTime<Utc>,
) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::PostPublishedPartial,
        EventStatus::Ok,
        attempt,
        None,
        metadata,
        now,
    )
}

pub fn post_publish_failed(
    post: &Post,
    attempt: u32,
    metadata: Value,
    now: DateTime<Utc>,
) -> PublishEvent {
    base_publish_event(
        post,
        PublishEventType::PostPublishFailed,
        EventStatus::Error,
        attempt,
        None,
        metadata,
        now,
    )
}

fn base_automation_event(
    run: &AutomationRun,
    event_type: AutomationEventType,
    status: EventStatus,
    metadata: Value,
    now: DateTime<Utc>,
) -> AutomationEvent {
    AutomationEvent {
        id: EventId::new(),
        tenant_id: run.tenant_id,
        project_id: run.project_id,
        run_id: run.id,
        event_type,
        status,
        metadata,
        created_at: now,
    }
}

pub fn run_queued(
    run: &AutomationRun,
    rule_id: RuleId,
    trigger_reason: &str,
    trigger_metadata: Value,
    now: DateTime<Utc>,
) -> AutomationEvent {
    let mut metadata = json!({
        "rule_id": rule_id.to_string(),
        "trigger_reason": trigger_reason,
    });
    if let (Some(target), Some(extra)) = (metadata.as_object_mut(), trigger_metadata.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    base_automation_event(run, AutomationEventType::AutomationRunQueued, EventStatus::Ok, metadata, now)
}

pub fn run_started(
    run: &AutomationRun,
    rule_id: RuleId,
    action: &str,
    now: DateTime<Utc>,
) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::AutomationRunStarted,
        EventStatus::Ok,
        json!({ "rule_id": rule_id.to_string(), "action_type": action }),
        now,
    )
}

pub fn run_completed(
    run: &AutomationRun,
    status: RunStatus,
    stats: Value,
    now: DateTime<Utc>,
) -> AutomationEvent {
    let event_status = if status == RunStatus::Failed {
        EventStatus::Error
    } else {
        EventStatus::Ok
    };
    base_automation_event(
        run,
        AutomationEventType::AutomationRunCompleted,
        event_status,
        stats,
        now,
    )
}

pub fn content_generated(
    run: &AutomationRun,
    item_id: ContentItemId,
    item_status: &str,
    now: DateTime<Utc>,
) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::ContentGenerated,
        EventStatus::Ok,
        json!({ "content_item_id": item_id.to_string(), "status": item_status }),
        now,
    )
}

pub fn content_generation_failed(
    run: &AutomationRun,
    item_id: ContentItemId,
    error: &str,
    now: DateTime<Utc>,
) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::ContentGenerationFailed,
        EventStatus::Error,
        json!({ "content_item_id": item_id.to_string(), "error": error }),
        now,
    )
}

pub fn approval_required(
    run: &AutomationRun,
    item_id: ContentItemId,
    now: DateTime<Utc>,
) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::ApprovalRequired,
        EventStatus::Ok,
        json!({ "content_item_id": item_id.to_string() }),
        now,
    )
}

pub fn posts_scheduled(run: &AutomationRun, count: u64, now: DateTime<Utc>) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::PostsScheduled,
        EventStatus::Ok,
        json!({ "scheduled_posts": count }),
        now,
    )
}

pub fn publish_enqueued(run: &AutomationRun, count: u64, now: DateTime<Utc>) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::PublishEnqueued,
        EventStatus::Ok,
        json!({ "enqueued_posts": count }),
        now,
    )
}

pub fn metrics_sync_queued(run: &AutomationRun, now: DateTime<Utc>) -> AutomationEvent {
    base_automation_event(
        run,
        AutomationEventType::MetricsSyncQueued,
        EventStatus::Ok,
        json!({}),
        now,
    )
}
