//! Instagram adapter — Graph API media container create + publish.
//!
//! Instagram has no text-only surface: publishing requires a media
//! reference in the post content.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::http::{build_client, classify_status, missing_credential, transport_error};
use super::{ChannelAdapter, PublishContext, PublishOutcome, compose_message, extract_media_url};
use crate::clock::SharedClock;
use crate::config::OauthClientConfig;
use crate::credentials::{CredentialVault, DecryptedCredential};
use crate::error::AdapterError;
use crate::store::models::ChannelCapabilities;
use crate::types::ChannelKind;

const GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";
const KIND: ChannelKind = ChannelKind::Instagram;

pub struct InstagramAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    oauth: OauthClientConfig,
    clock: SharedClock,
}

impl InstagramAdapter {
    pub fn new(vault: Arc<CredentialVault>, oauth: OauthClientConfig, clock: SharedClock) -> Self {
        Self {
            http: build_client(Duration::from_secs(25)),
            vault,
            oauth,
            clock,
        }
    }

    fn credential(&self, ctx: &PublishContext) -> Result<DecryptedCredential, AdapterError> {
        self.vault
            .decrypted(ctx.tenant_id, KIND)
            .map_err(|e| AdapterError::Retryable {
                channel_type: KIND.to_string(),
                message: e.to_string(),
            })?
            .ok_or_else(|| missing_credential(KIND, "Instagram connector is not connected"))
    }

    fn account_context(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<(String, String), AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Instagram access token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(60) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "Instagram access token expired".to_string(),
                });
            }
        }
        let ig_user_id = credential
            .account_ref
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Instagram business account id missing"))?;
        Ok((token, ig_user_id))
    }

    async fn graph_post(
        &self,
        path: String,
        payload: serde_json::Value,
    ) -> Result<String, AdapterError> {
        let response = self
            .http
            .post(format!("{GRAPH_BASE}/{path}"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(KIND, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(KIND, e))?;
        if !status.is_success() {
            return Err(classify_status(KIND, status, &body));
        }
        serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(ToString::to_string))
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "Graph API response missing id".to_string(),
            })
    }
}

#[async_trait]
impl ChannelAdapter for InstagramAdapter {
    fn kind(&self) -> ChannelKind {
        KIND
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: false,
            image: true,
            video: true,
            reels: true,
            shorts: false,
            max_length: Some(2200),
        }
    }

    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        self.account_context(&credential)?;
        Ok(())
    }

    async fn refresh_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        if !self.vault.try_lock_refresh(ctx.tenant_id, KIND) {
            return Ok(());
        }
        let result = self.refresh_inner(ctx).await;
        self.vault.unlock_refresh(ctx.tenant_id, KIND);
        result
    }

    async fn publish_text(&self, _ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        Err(AdapterError::Permanent {
            channel_type: KIND.to_string(),
            message: "Instagram requires a media reference in the post content".to_string(),
        })
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let (token, ig_user_id) = self.account_context(&credential)?;
        let media_url = extract_media_url(&ctx.post.content).ok_or_else(|| {
            AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "Instagram publish requested without a media reference".to_string(),
            }
        })?;
        let caption = compose_message(&ctx.post, self.capabilities().max_length);

        let creation_id = self
            .graph_post(
                format!("{ig_user_id}/media"),
                json!({ "image_url": media_url, "caption": caption, "access_token": token }),
            )
            .await?;
        let media_id = self
            .graph_post(
                format!("{ig_user_id}/media_publish"),
                json!({ "creation_id": creation_id, "access_token": token }),
            )
            .await?;

        Ok(PublishOutcome::new(KIND, media_id)
            .with_metadata(json!({ "creation_id": creation_id, "media_url": media_url })))
    }
}

impl InstagramAdapter {
    async fn refresh_inner(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        let current = credential
            .access_token
            .ok_or_else(|| missing_credential(KIND, "Instagram token missing, reconnect required"))?;
        if !self.oauth.is_configured() {
            return Err(missing_credential(KIND, "Meta client configuration is missing"));
        }

        let response = self
            .http
            .get(format!("{GRAPH_BASE}/oauth/access_token"))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("fb_exchange_token", current.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(KIND, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(KIND, e))?;
        if !status.is_success() {
            return Err(classify_status(KIND, status, &body));
        }

        let payload: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: format!("token exchange response unreadable: {e}"),
            })?;
        let access_token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "token exchange response missing access_token".to_string(),
            })?;
        let expires_in = payload
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(60 * 24 * 3600);

        self.vault
            .upsert(
                ctx.tenant_id,
                KIND,
                Some(access_token),
                None,
                Some(self.clock.now() + chrono::Duration::seconds(expires_in)),
                vec![],
                None,
                self.clock.now(),
            )
            .map_err(|e| AdapterError::Retryable {
                channel_type: KIND.to_string(),
                message: format!("failed to persist exchanged token: {e}"),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::encryption::TokenCipher;
    use crate::kv::MemoryKv;
    use crate::store::models::{Channel, ChannelStatus, Post, PostStatus};
    use crate::store::MemoryStore;
    use crate::types::{ChannelId, PostId, ProjectId, TenantId};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_text_only_posts_are_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let vault = Arc::new(CredentialVault::new(
            store,
            kv,
            TokenCipher::from_secret("ig-test"),
        ));
        let adapter = InstagramAdapter::new(vault, OauthClientConfig::default(), clock);

        let tenant_id = TenantId::new();
        let project_id = ProjectId::new();
        let ctx = PublishContext {
            tenant_id,
            post: Post {
                id: PostId::new(),
                tenant_id,
                project_id,
                title: "No media".into(),
                content: "plain text".into(),
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
                kind: ChannelKind::Instagram,
                name: "IG".into(),
                status: ChannelStatus::Active,
                capabilities: adapter.capabilities(),
                created_at: now,
                updated_at: now,
            },
        };

        let err = adapter.publish_text(&ctx).await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent { .. }));
        assert!(!adapter.capabilities().text);
        assert!(adapter.capabilities().supports_media());
    }
}
