//! TikTok adapter — v2 content init with a bounded status poll.
//!
//! TikTok ingests video by URL (`PULL_FROM_URL`) and processes it
//! asynchronously, so a publish is init + a few status polls. Posts without
//! a media reference cannot be delivered here.

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

const CONTENT_INIT_URL: &str = "https://open.tiktokapis.com/v2/post/publish/content/init/";
const STATUS_FETCH_URL: &str = "https://open.tiktokapis.com/v2/post/publish/status/fetch/";
const TOKEN_URL: &str = "https://open.tiktokapis.com/v2/oauth/token/";
const KIND: ChannelKind = ChannelKind::TikTok;

const STATUS_POLLS: u32 = 3;
const POLL_DELAY: Duration = Duration::from_secs(2);

pub struct TikTokAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    oauth: OauthClientConfig,
    clock: SharedClock,
}

impl TikTokAdapter {
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
            .ok_or_else(|| missing_credential(KIND, "TikTok connector is not connected"))
    }

    fn usable_token(&self, credential: &DecryptedCredential) -> Result<String, AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "TikTok access token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(60) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "TikTok access token expired".to_string(),
                });
            }
        }
        Ok(token)
    }

    async fn post_json(
        &self,
        url: &str,
        token: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
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
        serde_json::from_str(&body).map_err(|e| AdapterError::Permanent {
            channel_type: KIND.to_string(),
            message: format!("TikTok response unreadable: {e}"),
        })
    }
}

#[async_trait]
impl ChannelAdapter for TikTokAdapter {
    fn kind(&self) -> ChannelKind {
        KIND
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: false,
            image: false,
            video: true,
            reels: false,
            shorts: true,
            max_length: Some(2200),
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

    async fn publish_text(&self, _ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        Err(AdapterError::Permanent {
            channel_type: KIND.to_string(),
            message: "TikTok requires a video reference in the post content".to_string(),
        })
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let token = self.usable_token(&credential)?;
        let video_url = extract_media_url(&ctx.post.content).ok_or_else(|| {
            AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "TikTok publish requested without a media reference".to_string(),
            }
        })?;
        let title = compose_message(&ctx.post, self.capabilities().max_length);

        let init = self
            .post_json(
                CONTENT_INIT_URL,
                &token,
                json!({
                    "post_info": { "title": title, "privacy_level": "PUBLIC_TO_EVERYONE" },
                    "source_info": { "source": "PULL_FROM_URL", "video_url": video_url },
                }),
            )
            .await?;
        let publish_id = init
            .get("data")
            .and_then(|d| d.get("publish_id"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "content init response missing publish_id".to_string(),
            })?;

        // Processing is asynchronous; a failed status inside the poll budget
        // fails the attempt, anything still in flight is treated as accepted.
        for _ in 0..STATUS_POLLS {
            tokio::time::sleep(POLL_DELAY).await;
            let status_payload = self
                .post_json(
                    STATUS_FETCH_URL,
                    &token,
                    json!({ "publish_id": publish_id }),
                )
                .await?;
            let state = status_payload
                .get("data")
                .and_then(|d| d.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or("PROCESSING");
            match state {
                "PUBLISH_COMPLETE" => break,
                "FAILED" => {
                    let reason = status_payload
                        .get("data")
                        .and_then(|d| d.get("fail_reason"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    return Err(AdapterError::Permanent {
                        channel_type: KIND.to_string(),
                        message: format!("TikTok processing failed: {reason}"),
                    });
                }
                _ => continue,
            }
        }

        Ok(PublishOutcome::new(KIND, publish_id.clone())
            .with_metadata(json!({ "publish_id": publish_id, "video_url": video_url })))
    }
}

impl TikTokAdapter {
    async fn refresh_inner(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        let refresh_token = credential
            .refresh_token
            .ok_or_else(|| missing_credential(KIND, "TikTok refresh token not available"))?;
        if !self.oauth.is_configured() {
            return Err(missing_credential(KIND, "TikTok client configuration is missing"));
        }

        let form = [
            ("client_key", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        let response = self
            .http
            .post(TOKEN_URL)
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
            .unwrap_or(86_400);

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
