//! Threads adapter — container create + publish, mirroring the Graph flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::http::{build_client, classify_status, missing_credential, transport_error};
use super::{ChannelAdapter, PublishContext, PublishOutcome, compose_message, extract_media_url};
use crate::clock::SharedClock;
use crate::credentials::{CredentialVault, DecryptedCredential};
use crate::error::AdapterError;
use crate::store::models::ChannelCapabilities;
use crate::types::ChannelKind;

const THREADS_BASE: &str = "https://graph.threads.net/v1.0";
const KIND: ChannelKind = ChannelKind::Threads;

pub struct ThreadsAdapter {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    clock: SharedClock,
}

impl ThreadsAdapter {
    pub fn new(vault: Arc<CredentialVault>, clock: SharedClock) -> Self {
        Self {
            http: build_client(Duration::from_secs(20)),
            vault,
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
            .ok_or_else(|| missing_credential(KIND, "Threads connector is not connected"))
    }

    fn account_context(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<(String, String), AdapterError> {
        let token = credential
            .access_token
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Threads access token missing"))?;
        if let Some(expires_at) = credential.expires_at {
            if expires_at <= self.clock.now() + chrono::Duration::seconds(60) {
                return Err(AdapterError::Auth {
                    channel_type: KIND.to_string(),
                    message: "Threads access token expired".to_string(),
                });
            }
        }
        let user_id = credential
            .account_ref
            .clone()
            .ok_or_else(|| missing_credential(KIND, "Threads user id missing"))?;
        Ok((token, user_id))
    }

    async fn api_post(
        &self,
        path: String,
        payload: serde_json::Value,
    ) -> Result<String, AdapterError> {
        let response = self
            .http
            .post(format!("{THREADS_BASE}/{path}"))
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
                message: "Threads response missing id".to_string(),
            })
    }

    async fn create_and_publish(
        &self,
        token: &str,
        user_id: &str,
        container: serde_json::Value,
    ) -> Result<(String, String), AdapterError> {
        let creation_id = self.api_post(format!("{user_id}/threads"), container).await?;
        let thread_id = self
            .api_post(
                format!("{user_id}/threads_publish"),
                json!({ "creation_id": creation_id, "access_token": token }),
            )
            .await?;
        Ok((creation_id, thread_id))
    }
}

#[async_trait]
impl ChannelAdapter for ThreadsAdapter {
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
            max_length: Some(500),
        }
    }

    async fn validate_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        let credential = self.credential(ctx)?;
        self.account_context(&credential)?;
        Ok(())
    }

    async fn refresh_credentials(&self, ctx: &PublishContext) -> Result<(), AdapterError> {
        // Threads long-lived tokens are rotated by the OAuth collaborator;
        // the engine cannot mint a new one from here.
        let credential = self.credential(ctx)?;
        if credential.access_token.is_none() {
            return Err(missing_credential(KIND, "Threads token missing, reconnect required"));
        }
        Err(AdapterError::Auth {
            channel_type: KIND.to_string(),
            message: "Threads token refresh requires reconnect".to_string(),
        })
    }

    async fn publish_text(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let (token, user_id) = self.account_context(&credential)?;
        let text = compose_message(&ctx.post, self.capabilities().max_length);

        let (creation_id, thread_id) = self
            .create_and_publish(
                &token,
                &user_id,
                json!({ "media_type": "TEXT", "text": text, "access_token": token }),
            )
            .await?;
        Ok(PublishOutcome::new(KIND, thread_id)
            .with_metadata(json!({ "creation_id": creation_id })))
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let credential = self.credential(ctx)?;
        let (token, user_id) = self.account_context(&credential)?;
        let media_url = extract_media_url(&ctx.post.content).ok_or_else(|| {
            AdapterError::Permanent {
                channel_type: KIND.to_string(),
                message: "media publish requested without a media reference".to_string(),
            }
        })?;
        let text = compose_message(&ctx.post, self.capabilities().max_length);

        let (creation_id, thread_id) = self
            .create_and_publish(
                &token,
                &user_id,
                json!({
                    "media_type": "IMAGE",
                    "image_url": media_url,
                    "text": text,
                    "access_token": token,
                }),
            )
            .await?;
        Ok(PublishOutcome::new(KIND, thread_id)
            .with_metadata(json!({ "creation_id": creation_id, "media_url": media_url })))
    }
}
