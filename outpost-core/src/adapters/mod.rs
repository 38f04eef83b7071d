//! Channel adapters — pluggable delivery behind a uniform contract.
//!
//! Each channel type provides one [`ChannelAdapter`]. The registry is
//! populated explicitly at startup (`registry.register(adapter)`) and drives
//! the uniform publish flow: revoked-credential short circuit, validate →
//! refresh (one retry on a second auth failure) → validate, then text/media
//! routing by declared capabilities. Sandbox scenarios short-circuit the
//! flow with deterministic synthetic results and never touch the provider.

pub mod error_map;
pub mod facebook;
pub mod http;
pub mod instagram;
pub mod linkedin;
pub mod mock;
pub mod pinterest;
pub mod threads;
pub mod tiktok;
pub mod website;
pub mod x;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::credentials::CredentialVault;
use crate::error::AdapterError;
use crate::kv::{Kv, keys};
use crate::store::models::{Channel, ChannelCapabilities, Post};
use crate::types::{ChannelKind, TenantId};

/// Everything an adapter needs to deliver one post to one channel.
#[derive(Debug, Clone)]
pub struct PublishContext {
    pub tenant_id: TenantId,
    pub post: Post,
    pub channel: Channel,
}

/// Successful delivery result returned by adapters.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub external_post_id: String,
    pub platform: ChannelKind,
    pub metadata: Value,
}

impl PublishOutcome {
    pub fn new(platform: ChannelKind, external_post_id: impl Into<String>) -> Self {
        Self {
            external_post_id: external_post_id.into(),
            platform,
            metadata: json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Uniform per-channel delivery contract.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn capabilities(&self) -> ChannelCapabilities;

    /// Confirm the stored credential is usable right now. An auth failure
    /// here makes the registry attempt a refresh.
    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError>;

    /// Provider-specific token refresh; persists new tokens through the
    /// vault before returning.
    async fn refresh_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError>;

    async fn publish_text(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError>;

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError>;
}

/// First URL found in post content, treated as a media reference.
pub fn extract_media_url(content: &str) -> Option<&str> {
    content
        .split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
}

/// Title + body joined the way providers expect, truncated on a char
/// boundary to the channel's max length.
pub fn compose_message(post: &Post, max_length: Option<usize>) -> String {
    let full = if post.title.trim().is_empty() {
        post.content.clone()
    } else {
        format!("{}\n\n{}", post.title, post.content)
    };
    match max_length {
        Some(limit) if full.chars().count() > limit => full.chars().take(limit).collect(),
        _ => full,
    }
}

/// Sandbox scenarios settable per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxScenario {
    SimulateSuccess,
    SimulateRateLimit,
    SimulateAuthError,
}

impl SandboxScenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulateSuccess => "simulate_success",
            Self::SimulateRateLimit => "simulate_rate_limit",
            Self::SimulateAuthError => "simulate_auth_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulate_success" => Some(Self::SimulateSuccess),
            "simulate_rate_limit" => Some(Self::SimulateRateLimit),
            "simulate_auth_error" => Some(Self::SimulateAuthError),
            _ => None,
        }
    }
}

/// Static adapter registry keyed by channel kind.
pub struct AdapterRegistry {
    adapters: HashMap<ChannelKind, Box<dyn ChannelAdapter>>,
    vault: Arc<CredentialVault>,
    kv: Arc<dyn Kv>,
}

impl AdapterRegistry {
    pub fn new(vault: Arc<CredentialVault>, kv: Arc<dyn Kv>) -> Self {
        Self {
            adapters: HashMap::new(),
            vault,
            kv,
        }
    }

    pub fn register(&mut self, adapter: Box<dyn ChannelAdapter>) {
        let kind = adapter.kind();
        if self.adapters.insert(kind, adapter).is_some() {
            tracing::warn!(channel = %kind, "adapter replaced in registry");
        }
    }

    pub fn get(&self, kind: ChannelKind) -> Result<&dyn ChannelAdapter, AdapterError> {
        self.adapters
            .get(&kind)
            .map(|a| a.as_ref())
            .ok_or_else(|| AdapterError::Unsupported {
                channel_type: kind.to_string(),
            })
    }

    pub fn registered_kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<ChannelKind> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn capabilities(&self, kind: ChannelKind) -> Result<ChannelCapabilities, AdapterError> {
        Ok(self.get(kind)?.capabilities())
    }

    fn sandbox_scenario(&self, ctx: &PublishContext) -> Option<SandboxScenario> {
        // Fail open: a KV error just means no sandbox override.
        self.kv
            .get(&keys::connector_sandbox(ctx.channel.id))
            .ok()
            .flatten()
            .and_then(|raw| SandboxScenario::parse(&raw))
    }

    /// Execute the uniform publish contract for one (post, channel).
    pub async fn deliver(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let kind = ctx.channel.kind;

        if let Some(scenario) = self.sandbox_scenario(ctx) {
            tracing::info!(
                channel = %kind,
                post_id = %ctx.post.id,
                scenario = scenario.as_str(),
                "sandbox scenario active, skipping provider call"
            );
            return match scenario {
                SandboxScenario::SimulateSuccess => {
                    let prefix: String = ctx.post.id.to_string().chars().take(8).collect();
                    Ok(PublishOutcome::new(kind, format!("sandbox-{prefix}"))
                        .with_metadata(json!({ "sandbox": true })))
                }
                SandboxScenario::SimulateRateLimit => Err(AdapterError::Retryable {
                    channel_type: kind.to_string(),
                    message: "sandbox simulated rate limit (HTTP 429)".to_string(),
                }),
                SandboxScenario::SimulateAuthError => Err(AdapterError::Auth {
                    channel_type: kind.to_string(),
                    message: "sandbox simulated auth error".to_string(),
                }),
            };
        }

        let adapter = self.get(kind)?;

        let revoked = self
            .vault
            .is_revoked(ctx.tenant_id, kind)
            .unwrap_or(false);
        if revoked {
            return Err(AdapterError::Auth {
                channel_type: kind.to_string(),
                message: format!("connector credential revoked for {kind}"),
            });
        }

        if let Err(err) = adapter.validate_credentials(ctx).await {
            match err {
                AdapterError::Auth { .. } => {
                    if let Err(refresh_err) = adapter.refresh_credentials(ctx).await {
                        match refresh_err {
                            AdapterError::Auth { .. } => adapter.refresh_credentials(ctx).await?,
                            other => return Err(other),
                        }
                    }
                    adapter.validate_credentials(ctx).await?;
                }
                other => return Err(other),
            }
        }

        let media_reference = extract_media_url(&ctx.post.content);
        if media_reference.is_some() && adapter.capabilities().supports_media() {
            adapter.publish_media(ctx).await
        } else {
            adapter.publish_text(ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockAdapter;
    use super::*;
    use crate::clock::ManualClock;
    use crate::encryption::TokenCipher;
    use crate::kv::MemoryKv;
    use crate::store::models::{ChannelStatus, PostStatus};
    use crate::store::MemoryStore;
    use crate::types::{ChannelId, PostId, ProjectId};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn context(kind: ChannelKind) -> PublishContext {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let tenant_id = TenantId::new();
        let project_id = ProjectId::new();
        PublishContext {
            tenant_id,
            post: Post {
                id: PostId::new(),
                tenant_id,
                project_id,
                title: "Hello".into(),
                content: "Body text".into(),
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

    fn registry() -> (AdapterRegistry, Arc<MemoryKv>, Arc<CredentialVault>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock));
        let vault = Arc::new(CredentialVault::new(
            store,
            kv.clone(),
            TokenCipher::from_secret("registry-test"),
        ));
        (AdapterRegistry::new(vault.clone(), kv.clone()), kv, vault)
    }

    #[test]
    fn test_extract_media_url() {
        assert_eq!(
            extract_media_url("check this https://cdn.example.com/a.png out"),
            Some("https://cdn.example.com/a.png")
        );
        assert_eq!(extract_media_url("plain text only"), None);
    }

    #[test]
    fn test_unsupported_kind() {
        let (registry, _, _) = registry();
        let result = registry.get(ChannelKind::Pinterest);
        assert!(matches!(result, Err(AdapterError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_deliver_happy_path() {
        let (mut registry, _, _) = registry();
        registry.register(Box::new(
            MockAdapter::new(ChannelKind::LinkedIn).succeed_with("urn:li:share:1"),
        ));
        let ctx = context(ChannelKind::LinkedIn);
        let outcome = registry.deliver(&ctx).await.unwrap();
        assert_eq!(outcome.external_post_id, "urn:li:share:1");
        assert_eq!(outcome.platform, ChannelKind::LinkedIn);
    }

    #[tokio::test]
    async fn test_deliver_refreshes_on_auth_failure() {
        let (mut registry, _, _) = registry();
        let adapter = MockAdapter::new(ChannelKind::X)
            .fail_validation_times(1)
            .succeed_with("tweet-9");
        let calls = adapter.calls();
        registry.register(Box::new(adapter));

        let ctx = context(ChannelKind::X);
        let outcome = registry.deliver(&ctx).await.unwrap();
        assert_eq!(outcome.external_post_id, "tweet-9");
        let snapshot = calls.lock().unwrap().clone();
        // validate (auth error) -> refresh -> validate -> publish_text
        assert_eq!(snapshot.validate, 2);
        assert_eq!(snapshot.refresh, 1);
        assert_eq!(snapshot.publish_text, 1);
    }

    #[tokio::test]
    async fn test_deliver_revoked_credential_short_circuits() {
        let (mut registry, _, vault) = registry();
        let adapter = MockAdapter::new(ChannelKind::Facebook).succeed_with("fb-1");
        let calls = adapter.calls();
        registry.register(Box::new(adapter));

        let ctx = context(ChannelKind::Facebook);
        vault
            .upsert(ctx.tenant_id, ChannelKind::Facebook, Some("t"), None, None, vec![], None, ctx.post.created_at)
            .unwrap();
        vault
            .revoke(ctx.tenant_id, ChannelKind::Facebook, ctx.post.created_at)
            .unwrap();

        let err = registry.deliver(&ctx).await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth { .. }));
        assert_eq!(calls.lock().unwrap().publish_text, 0);
    }

    #[tokio::test]
    async fn test_sandbox_scenarios() {
        let (mut registry, kv, _) = registry();
        let adapter = MockAdapter::new(ChannelKind::Threads).succeed_with("threads-1");
        let calls = adapter.calls();
        registry.register(Box::new(adapter));
        let ctx = context(ChannelKind::Threads);

        kv.set_ex(
            &keys::connector_sandbox(ctx.channel.id),
            SandboxScenario::SimulateSuccess.as_str(),
            Duration::from_secs(900),
        )
        .unwrap();
        let outcome = registry.deliver(&ctx).await.unwrap();
        assert!(outcome.external_post_id.starts_with("sandbox-"));
        assert_eq!(outcome.metadata["sandbox"], true);

        kv.set_ex(
            &keys::connector_sandbox(ctx.channel.id),
            SandboxScenario::SimulateRateLimit.as_str(),
            Duration::from_secs(900),
        )
        .unwrap();
        assert!(matches!(
            registry.deliver(&ctx).await.unwrap_err(),
            AdapterError::Retryable { .. }
        ));

        kv.set_ex(
            &keys::connector_sandbox(ctx.channel.id),
            SandboxScenario::SimulateAuthError.as_str(),
            Duration::from_secs(900),
        )
        .unwrap();
        assert!(matches!(
            registry.deliver(&ctx).await.unwrap_err(),
            AdapterError::Auth { .. }
        ));

        // The provider was never called.
        assert_eq!(calls.lock().unwrap().publish_text, 0);
    }

    #[tokio::test]
    async fn test_media_routing_by_capabilities() {
        let (mut registry, _, _) = registry();
        let adapter = MockAdapter::new(ChannelKind::Instagram)
            .with_capabilities(ChannelCapabilities {
                text: true,
                image: true,
                ..Default::default()
            })
            .succeed_with("ig-media-1");
        let calls = adapter.calls();
        registry.register(Box::new(adapter));

        let mut ctx = context(ChannelKind::Instagram);
        ctx.post.content = "Look: https://cdn.example.com/pic.jpg".into();
        registry.deliver(&ctx).await.unwrap();

        let snapshot = calls.lock().unwrap().clone();
        assert_eq!(snapshot.publish_media, 1);
        assert_eq!(snapshot.publish_text, 0);
    }
}
