//! LinkedIn adapter — UGC Posts API with refresh-token rotation.

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

const REFRESH_URL: &str = "https://www.linkedin.com/oauth/v2/accessToken";
const UGC_POSTS_URL: &str = "https://api.linkedin.com/v2/ugcPosts";
const KIND: ChannelKind = ChannelKind::LinkedIn;

/// Access tokens this close to expiry are treated as invalid so the
/// registry refreshes them before a publish attempt.
const EXPIRY_SLACK_SECS: i64 = 60;

pub struct LinkedInAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    oauth: OauthClientConfig,
    clock: SharedClock,
}

impl LinkedInAdapter {
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
            .ok_or_else(|| missing_credential(KIND, "LinkedIn connector is not connected"))
    }

    fn usable_token(&self, credential: &DecryptedCredential) -> Result<String, AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "LinkedIn access token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(EXPIRY_SLACK_SECS) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "LinkedIn access token expired".to_string(),
                });
            }
        }
        Ok(token)
    }
}

#[async_trait]
impl ChannelAdapter for LinkedInAdapter {
    fn kind(&self) -> ChannelKind {
        KIND
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: true,
            image: true,
            video: false,
            reels: false,
            shorts: false,
            max_length: Some(3000),
        }
    }

    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        self.usable_token(&credential)?;
        if credential.account_ref.is_none() {
            return Err(missing_credential(KIND, "LinkedIn member id missing"));
        }
        Ok(())
    }

    async fn refresh_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        if !self.vault.try_lock_refresh(ctx.tenant_id, KIND) {
            // Another worker holds the refresh lock; the follow-up validate
            // re-reads whatever it persisted.
            return Ok(());
        }
        let result = self.refresh_inner(ctx).await;
        self.vault.unlock_refresh(ctx.tenant_id, KIND);
        result
    }

    async fn publish_text(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let token = self.usable_token(&credential)?;
        let member_id = credential
            .account_ref
            .ok_or_else(|| missing_credential(KIND, "LinkedIn member id missing"))?;

        let text = compose_message(&ctx.post, self.capabilities().max_length);
        let payload = json!({
            "author": format!("urn:li:person:{member_id}"),
            "lifecycleState": "PUBLISHED",
            "specificContent": {
                "com.linkedin.ugc.ShareContent": {
                    "shareCommentary": { "text": text },
                    "shareMediaCategory": "NONE",
                }
            },
            "visibility": { "com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC" },
        });

        let response = self
            .http
            .post(UGC_POSTS_URL)
            .bearer_auth(&token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(KIND, e))?;

        let status = response.status();
        let header_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(KIND, e))?;
        if !status.is_success() {
            return Err(classify_status(KIND, status, &body));
        }

        let external_post_id = header_id
            .or_else(|| {
                serde_json::from_str::<serde_json::Value>(&body)
                    .ok()?
                    .get("id")?
                    .as_str()
                    .map(ToString::to_string)
            })
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "LinkedIn publish response missing post id".to_string(),
            })?;

        Ok(PublishOutcome::new(KIND, external_post_id))
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        // Image shares stay on the text path until asset upload lands.
        self.publish_text(ctx).await
    }
}

impl LinkedInAdapter {
    async fn refresh_inner(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        let refresh_token = credential
            .refresh_token
            .ok_or_else(|| missing_credential(KIND, "LinkedIn refresh token not available"))?;
        if !self.oauth.is_configured() {
            return Err(missing_credential(KIND, "LinkedIn client configuration is missing"));
        }

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(REFRESH_URL)
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
                message: format!("LinkedIn token refresh response unreadable: {e}"),
            })?;
        let access_token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "LinkedIn token refresh response missing access_token".to_string(),
            })?;
        let next_refresh_token = payload
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or(refresh_token.as_str());
        let expires_in = payload
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(3600);
        let expires_at = self.clock.now() + chrono::Duration::seconds(expires_in);

        self.vault
            .upsert(
                ctx.tenant_id,
                KIND,
                Some(access_token),
                Some(next_refresh_token),
                Some(expires_at),
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
