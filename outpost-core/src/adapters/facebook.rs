//! Facebook adapter — Graph API page feed + photos.

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
const KIND: ChannelKind = ChannelKind::Facebook;

pub struct FacebookAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    oauth: OauthClientConfig,
    clock: SharedClock,
}

impl FacebookAdapter {
    pub fn new(vault: Arc<CredentialVault>, oauth: OauthClientConfig, clock: SharedClock) -> Self {
        Self {
            http: build_client(Duration::from_secs(20)),
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
            .ok_or_else(|| missing_credential(KIND, "Facebook connector is not connected"))
    }

    fn page_context(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<(String, String), AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Facebook page token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(60) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "Facebook page token expired".to_string(),
                });
            }
        }
        let page_id = credential
            .account_ref
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Facebook page id missing"))?;
        Ok((token, page_id))
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
            .and_then(|v| {
                v.get("id")
                    .or_else(|| v.get("post_id"))
                    .and_then(|id| id.as_str())
                    .map(ToString::to_string)
            })
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "Graph API response missing post id".to_string(),
            })
    }
}

#[async_trait]
impl ChannelAdapter for FacebookAdapter {
    fn kind(&self) -> ChannelKind {
        KIND
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: true,
            image: true,
            video: true,
            reels: true,
            shorts: false,
            max_length: Some(63_206),
        }
    }

    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        self.page_context(&credential)?;
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

    async fn publish_text(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let (token, page_id) = self.page_context(&credential)?;
        let message = compose_message(&ctx.post, self.capabilities().max_length);
        let external_post_id = self
            .graph_post(
                format!("{page_id}/feed"),
                json!({ "message": message, "access_token": token }),
            )
            .await?;
        Ok(PublishOutcome::new(KIND, external_post_id))
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let (token, page_id) = self.page_context(&credential)?;
        let media_url = extract_media_url(&ctx.post.content).ok_or_else(|| {
            AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "media publish requested without a media reference".to_string(),
            }
        })?;
        let caption = compose_message(&ctx.post, self.capabilities().max_length);
        let external_post_id = self
            .graph_post(
                format!("{page_id}/photos"),
                json!({ "url": media_url, "caption": caption, "access_token": token }),
            )
            .await?;
        Ok(PublishOutcome::new(KIND, external_post_id)
            .with_metadata(json!({ "media_url": media_url })))
    }
}

impl FacebookAdapter {
    /// Long-lived token exchange; Meta rotates the same grant rather than
    /// issuing a separate refresh token.
    async fn refresh_inner(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        let current = credential
            .access_token
            .ok_or_else(|| missing_credential(KIND, "Facebook token missing, reconnect required"))?;
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
        let expires_at = self.clock.now() + chrono::Duration::seconds(expires_in);

        self.vault
            .upsert(
                ctx.tenant_id,
                KIND,
                Some(access_token),
                None,
                Some(expires_at),
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
