//! Built-in website channel adapter.
//!
//! Publishes to the tenant's hosted site: no external provider, no
//! credentials. The adapter produces a tenant-unique slug; the publisher
//! persists the website publication row keyed by it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{ChannelAdapter, PublishContext, PublishOutcome};
use crate::clock::SharedClock;
use crate::error::AdapterError;
use crate::store::models::ChannelCapabilities;
use crate::store::Store;
use crate::types::{ChannelKind, PostId, TenantId};

pub struct WebsiteAdapter {
    store: Arc<dyn Store>,
    clock: SharedClock,
}

impl WebsiteAdapter {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }
}

/// Lowercased title with every non-alphanumeric run collapsed to `-`.
pub fn build_slug_base(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut previous_dash = true;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            previous_dash = false;
        } else if !previous_dash {
            slug.push('-');
            previous_dash = true;
        }
    }
    let trimmed = slug.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "post".to_string()
    } else {
        trimmed
    }
}

/// `<slug-base>-<post-id-prefix>`, falling back to a timestamp suffix when
/// a tenant already holds the candidate.
pub fn generate_unique_slug(
    store: &dyn Store,
    tenant_id: TenantId,
    title: &str,
    post_id: PostId,
    now_ts: i64,
) -> Result<String, AdapterError> {
    let base = build_slug_base(title);
    let id_text = post_id.to_string();
    let prefix = id_text.split('-').next().unwrap_or("post");
    let candidate = format!("{base}-{prefix}");

    let taken = store
        .website_slug_exists(tenant_id, &candidate)
        .map_err(|e| AdapterError::Retryable {
            channel_type: ChannelKind::Website.to_string(),
            message: e.to_string(),
        })?;
    if !taken {
        return Ok(candidate);
    }
    Ok(format!("{candidate}-{now_ts}"))
}

#[async_trait]
impl ChannelAdapter for WebsiteAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Website
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            text: true,
            image: true,
            video: false,
            reels: false,
            shorts: false,
            max_length: None,
        }
    }

    async fn validate_credentials(&self, _ctx: &PublishContext) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn refresh_credentials(&self, _ctx: &PublishContext) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn publish_text(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        let slug = generate_unique_slug(
            self.store.as_ref(),
            ctx.tenant_id,
            &ctx.post.title,
            ctx.post.id,
            self.clock.now().timestamp(),
        )?;
        Ok(PublishOutcome::new(ChannelKind::Website, slug.clone())
            .with_metadata(json!({ "slug": slug, "title": ctx.post.title })))
    }

    async fn publish_media(&self, ctx: &PublishContext) -> Result<PublishOutcome, AdapterError> {
        // Media lives inline in the rendered page; same path as text.
        self.publish_text(ctx).await
    }
}
