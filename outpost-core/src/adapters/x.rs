//! X (Twitter) adapter — v2 tweets endpoint with OAuth2 refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::http::{build_client, classify_status, missing_credential, transport_error};
use super::{ChannelAdapter, PublishContext, PublishOutcome, compose_message};
use crate::clock::SharedClock;
use crate::config::OauthClientConfig;
use crate::credentials::{CredentialVault, DecryptedCredential};
use crate::error::AdapterError;
use crate::store::models::ChannelCapabilities;
use crate::types::ChannelKind;

const TWEETS_URL: &str = "https://api.twitter.com/2/tweets";
const TOKEN_URL: &str = "https://api.twitter.com/2/oauth2/token";
const KIND: ChannelKind = ChannelKind::X;

pub struct XAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    oauth: OauthClientConfig,
    clock: SharedClock,
}

impl XAdapter {
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
            .ok_or_else(|| missing_credential(KIND, "X connector is not connected"))
    }

    fn usable_token(&self, credential: &DecryptedCredential) -> Result<String, AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "X access token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(60) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "X access token expired".to_string(),
                });
            }
        }
        Ok(token)
    }
}

#[async_trait]
impl ChannelAdapter for XAdapter {
    fn kind(&self) -> ChannelKind {
        KIND
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: true,
            image: true,
            video: true,
            reels: false,
            shorts: false,
            max_length: Some(280),
        }
    }

    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        self.usable_token(&credential)?;
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
        let token = self.usable_token(&credential)?;
        let text = compose_message(&ctx.post, self.capabilities().max_length);

        let response = self
            .http
            .post(TWEETS_URL)
            .bearer_auth(&token)
            .json(&json!({ "text": text }))
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

        let tweet_id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("data")?
                    .get("id")?
                    .as_str()
                    .map(ToString::to_string)
            })
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "tweet response missing data.id".to_string(),
            })?;
        Ok(PublishOutcome::new(KIND, tweet_id))
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        // Media upload goes through the v1.1 chunked endpoint; until that
        // lands, link previews carry the media.
        self.publish_text(ctx).await
    }
}

impl XAdapter {
    async fn refresh_inner(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        let refresh_token = credential
            .refresh_token
            .ok_or_else(|| missing_credential(KIND, "X refresh token not available"))?;
        if !self.oauth.is_configured() {
            return Err(missing_credential(KIND, "X client configuration is missing"));
        }

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.oauth.client_id.as_str()),
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
        let next_refresh = payload
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or(refresh_token.as_str());
        let expires_in = payload
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(7200);

        self.vault
            .upsert(
                ctx.tenant_id,
                KIND,
                Some(access_token),
                Some(next_refresh),
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
