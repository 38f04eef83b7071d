//! Pinterest adapter — v5 pins API. Pins are image-first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::http::{build_client, classify_status, missing_credential, transport_error};
use super::{ChannelAdapter, PublishContext, PublishOutcome, extract_media_url};
use crate::clock::SharedClock;
use crate::config::OauthClientConfig;
use crate::credentials::{CredentialVault, DecryptedCredential};
use crate::error::AdapterError;
use crate::store::models::ChannelCapabilities;
use crate::types::ChannelKind;

const PINS_URL: &str = "https://api.pinterest.com/v5/pins";
const TOKEN_URL: &str = "https://api.pinterest.com/v5/oauth/token";
const KIND: ChannelKind = ChannelKind::Pinterest;

pub struct PinterestAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    oauth: OauthClientConfig,
    clock: SharedClock,
}

impl PinterestAdapter {
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
            .ok_or_else(|| missing_credential(KIND, "Pinterest connector is not connected"))
    }

    fn board_context(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<(String, String), AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Pinterest access token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(60) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "Pinterest access token expired".to_string(),
                });
            }
        }
        let board_id = credential
            .account_ref
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Pinterest board id missing"))?;
        Ok((token, board_id))
    }
}

#[async_trait]
impl ChannelAdapter for PinterestAdapter {
    fn kind(&self) -> ChannelKind {
        KIND
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: false,
            image: true,
            video: true,
            reels: false,
            shorts: false,
            max_length: Some(800),
        }
    }

    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        self.board_context(&credential)?;
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
            message: "Pinterest requires an image reference in the post content".to_string(),
        })
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let (token, board_id) = self.board_context(&credential)?;
        let media_url = extract_media_url(&ctx.post.content).ok_or_else(|| {
            AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "Pinterest publish requested without an image reference".to_string(),
            }
        })?;

        let description: String = ctx.post.content.chars().take(800).collect();
        let payload = json!({
            "board_id": board_id,
            "title": ctx.post.title,
            "description": description,
            "media_source": { "source_type": "image_url", "url": media_url },
        });

        let response = self
            .http
            .post(PINS_URL)
            .bearer_auth(&token)
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

        let pin_id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(ToString::to_string))
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "pin response missing id".to_string(),
            })?;
        Ok(PublishOutcome::new(KIND, pin_id).with_metadata(json!({ "media_url": media_url })))
    }
}

impl PinterestAdapter {
    async fn refresh_inner(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        let refresh_token = credential
            .refresh_token
            .ok_or_else(|| missing_credential(KIND, "Pinterest refresh token not available"))?;
        if !self.oauth.is_configured() {
            return Err(missing_credential(KIND, "Pinterest client configuration is missing"));
        }

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.oauth.client_id, Some(&self.oauth.client_secret))
            .form(&form)
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
                message: format!("token refresh response unreadable: {e}"),
            })?;
        let access_token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "token refresh response missing access_token".to_string(),
            })?;
        let expires_in = payload
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(2_592_000);

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
                message: format!("failed to persist refreshed tokens: {e}"),
            })?;
        Ok(())
    }
}
