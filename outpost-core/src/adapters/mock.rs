//! Scriptable adapter for tests and local development.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ChannelAdapter, PublishContext, PublishOutcome};
use crate::error::AdapterError;
use crate::store::models::ChannelCapabilities;
use crate::types::ChannelKind;

/// Call counters recorded by a [`MockAdapter`].
#[derive(Debug, Default, Clone)]
pub struct MockCalls {
    pub validate: u32,
    pub refresh: u32,
    pub publish_text: u32,
    pub publish_media: u32,
}

/// One scripted publish result.
#[derive(Debug, Clone)]
pub enum MockResult {
    Success(String),
    Auth(String),
    Retryable(String),
    Permanent(String),
}

/// Adapter returning scripted results in order. When the script runs out,
/// the configured fallback success id is repeated.
pub struct MockAdapter {
    kind: ChannelKind,
    capabilities: ChannelCapabilities,
    fallback_id: String,
    calls: Arc<Mutex<MockCalls>>,
    results: Mutex<VecDeque<MockResult>>,
    validation_failures_left: Mutex<u32>,
}

impl MockAdapter {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            capabilities: ChannelCapabilities::text_only(3000),
            fallback_id: format!("{kind}-external-1"),
            calls: Arc::new(Mutex::new(MockCalls::default())),
            results: Mutex::new(VecDeque::new()),
            validation_failures_left: Mutex::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ChannelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Append a scripted result.
    pub fn then(self, result: MockResult) -> Self {
        self.results.lock().unwrap().push_back(result);
        self
    }

    /// Configure the fallback success id returned once the script is empty.
    pub fn succeed_with(mut self, external_post_id: impl Into<String>) -> Self {
        self.fallback_id = external_post_id.into();
        self
    }

    /// Make the next `count` validate calls fail with an auth error.
    pub fn fail_validation_times(self, count: u32) -> Self {
        *self.validation_failures_left.lock().unwrap() = count;
        self
    }

    /// Shared handle onto the recorded call counters.
    pub fn calls(&self) -> Arc<Mutex<MockCalls>> {
        self.calls.clone()
    }

    fn next_result(&self) -> MockResult {
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockResult::Success(self.fallback_id.clone()))
    }
}

fn outcome_from(kind: ChannelKind, result: MockResult) -> Result<PublishOutcome, AdapterError> {
    match result {
        MockResult::Success(id) => Ok(PublishOutcome::new(kind, id)),
        MockResult::Auth(message) => Err(AdapterError::Auth {
            channel_type: kind.to_string(),
            message,
        }),
        MockResult::Retryable(message) => Err(AdapterError::Retryable {
            channel_type: kind.to_string(),
            message,
        }),
        MockResult::Permanent(message) => Err(AdapterError::Permanent {
            channel_type: kind.to_string(),
            message,
        }),
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn capabilities(&self) -> ChannelCapabilities {
        self.capabilities.clone()
    }

    async fn validate_credentials(&self, _ctx: &PublishContext) -> Result<(), AdapterError> {
        self.calls.lock().unwrap().validate += 1;
        let mut failures = self.validation_failures_left.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(AdapterError::Auth {
                channel_type: self.kind.to_string(),
                message: "scripted validation failure".to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_credentials(&self, _ctx: &PublishContext) -> Result<(), AdapterError> {
        self.calls.lock().unwrap().refresh += 1;
        Ok(())
    }

    async fn publish_text(&self, _ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        self.calls.lock().unwrap().publish_text += 1;
        outcome_from(self.kind, self.next_result())
    }

    async fn publish_media(&self, _ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        self.calls.lock().unwrap().publish_media += 1;
        outcome_from(self.kind, self.next_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{Channel, ChannelStatus, Post, PostStatus};
    use crate::types::{ChannelId, PostId, ProjectId, TenantId};
    use chrono::{TimeZone, Utc};

    fn ctx(kind: ChannelKind) -> PublishContext {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let tenant_id = TenantId::new();
        let project_id = ProjectId::new();
        PublishContext {
            tenant_id,
            post: Post {
                id: PostId::new(),
                tenant_id,
                project_id,
                title: "t".into(),
                content: "c".into(),
                status: PostStatus::Publishing,
                publish_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
            channel: Channel {
                id: ChannelId::new(),
                tenant_id,
                project_id,
                kind,
                name: kind.to_string(),
                status: ChannelStatus::Active,
                capabilities: ChannelCapabilities::text_only(3000),
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[tokio::test]
    async fn test_scripted_results_in_order() {
        let adapter = MockAdapter::new(ChannelKind::LinkedIn)
            .then(MockResult::Retryable("HTTP 500".into()))
            .then(MockResult::Retryable("HTTP 502".into()))
            .succeed_with("urn:li:share:42");
        let context = ctx(ChannelKind::LinkedIn);

        assert!(adapter.publish_text(&context).await.is_err());
        assert!(adapter.publish_text(&context).await.is_err());
        let outcome = adapter.publish_text(&context).await.unwrap();
        assert_eq!(outcome.external_post_id, "urn:li:share:42");
        assert_eq!(adapter.calls().lock().unwrap().publish_text, 3);
    }

    #[tokio::test]
    async fn test_validation_failure_script() {
        let adapter = MockAdapter::new(ChannelKind::X).fail_validation_times(2);
        let context = ctx(ChannelKind::X);
        assert!(adapter.validate_credentials(&context).await.is_err());
        assert!(adapter.validate_credentials(&context).await.is_err());
        assert!(adapter.validate_credentials(&context).await.is_ok());
    }
}
