//! Inbound webhook verification and idempotent processing.
//!
//! Provider webhooks carry an HMAC-SHA256 signature over the raw body;
//! Stripe uses its `t=...,v1=...` header scheme with a timestamp tolerance.
//! Replays are dropped by a KV dedupe key, with the `stripe_events` unique
//! constraint as the backstop when KV is unavailable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::{StoreError, WebhookError};
use crate::kv::{Kv, keys};
use crate::store::models::StripeEvent;
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Default Stripe signature tolerance.
pub const STRIPE_TOLERANCE: Duration = Duration::from_secs(300);
const DEDUPE_TTL: Duration = Duration::from_secs(3600);

fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}

fn mac_for(secret: &str, payload: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(payload);
    mac
}

/// Verify a plain `X-Signature: <hex>` HMAC-SHA256 header.
pub fn verify_signature(
    provider: &str,
    secret: &str,
    payload: &[u8],
    signature_hex: &str,
) -> Result<(), WebhookError> {
    let provided = hex_decode(signature_hex.trim()).ok_or_else(|| {
        WebhookError::InvalidSignature {
            provider: provider.to_string(),
        }
    })?;
    mac_for(secret, payload)
        .verify_slice(&provided)
        .map_err(|_| WebhookError::InvalidSignature {
            provider: provider.to_string(),
        })
}

/// Parsed form of Stripe's `Stripe-Signature` header.
#[derive(Debug, Clone)]
pub struct StripeSignature {
    pub timestamp: i64,
    pub v1_signatures: Vec<String>,
}

pub fn parse_stripe_signature(header: &str) -> Result<StripeSignature, WebhookError> {
    let mut timestamp = None;
    let mut v1_signatures = Vec::new();
    for part in header.split(',') {
        let mut pieces = part.trim().splitn(2, '=');
        match (pieces.next(), pieces.next()) {
            (Some("t"), Some(value)) => {
                timestamp = value.parse::<i64>().ok();
            }
            (Some("v1"), Some(value)) => {
                v1_signatures.push(value.to_string());
            }
            _ => continue,
        }
    }
    let timestamp = timestamp.ok_or_else(|| WebhookError::Malformed {
        message: "signature header missing timestamp".to_string(),
    })?;
    if v1_signatures.is_empty() {
        return Err(WebhookError::Malformed {
            message: "signature header missing v1 signature".to_string(),
        });
    }
    Ok(StripeSignature {
        timestamp,
        v1_signatures,
    })
}

/// Verify a Stripe webhook: timestamp within tolerance and at least one
/// `v1` signature matching `HMAC(secret, "{t}.{body}")`.
pub fn verify_stripe_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), WebhookError> {
    let signature = parse_stripe_signature(header)?;
    let skew = (now.timestamp() - signature.timestamp).abs();
    if skew > tolerance.as_secs() as i64 {
        return Err(WebhookError::StaleTimestamp { skew_secs: skew });
    }

    let signed_payload = format!("{}.{}", signature.timestamp, payload);
    for candidate in &signature.v1_signatures {
        if let Some(decoded) = hex_decode(candidate) {
            if mac_for(secret, signed_payload.as_bytes())
                .verify_slice(&decoded)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
    Err(WebhookError::InvalidSignature {
        provider: "stripe".to_string(),
    })
}

/// Outcome of receiving a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Deduplicated,
}

pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn Kv>) -> Self {
        Self { store, kv }
    }

    /// Record a verified Stripe event exactly once. The first delivery is
    /// `Processed` (the billing collaborator applies it); replays are
    /// `Deduplicated`. A KV failure counts as not-deduplicated — the
    /// `stripe_events` unique constraint is the backstop, so an event is
    /// never lost to a cache outage.
    pub fn record_stripe_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let dedupe_key = keys::webhook_dedupe("stripe", event_id);
        match self.kv.set_nx_ex(&dedupe_key, "1", DEDUPE_TTL) {
            Ok(false) => {
                info!(event_id, "stripe webhook deduplicated by cache");
                return Ok(WebhookOutcome::Deduplicated);
            }
            Ok(true) => {}
            Err(err) => {
                warn!(event_id, error = %err, "webhook dedupe cache unavailable, relying on store");
            }
        }

        match self.store.insert_stripe_event(&StripeEvent {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            processed_at: now,
        }) {
            Ok(()) => {
                info!(event_id, event_type, "stripe webhook recorded");
                Ok(WebhookOutcome::Processed)
            }
            Err(StoreError::Conflict { .. }) => {
                info!(event_id, "stripe webhook deduplicated by ledger");
                Ok(WebhookOutcome::Deduplicated)
            }
            Err(err) => Err(WebhookError::Malformed {
                message: format!("failed to record webhook event: {err}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::kv::MemoryKv;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        hex_encode(&mac_for(secret, payload).finalize().into_bytes())
    }

    #[test]
    fn test_plain_signature_roundtrip() {
        let payload = br#"{"event":"post.published"}"#;
        let signature = sign("shared-secret", payload);
        assert!(verify_signature("linkedin", "shared-secret", payload, &signature).is_ok());
        assert!(verify_signature("linkedin", "wrong-secret", payload, &signature).is_err());
        assert!(verify_signature("linkedin", "shared-secret", b"tampered", &signature).is_err());
        assert!(verify_signature("linkedin", "shared-secret", payload, "zz-not-hex").is_err());
    }

    fn stripe_header(secret: &str, payload: &str, timestamp: i64) -> String {
        let signed = format!("{timestamp}.{payload}");
        format!("t={timestamp},v1={}", sign(secret, signed.as_bytes()))
    }

    #[test]
    fn test_stripe_signature_valid() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let payload = r#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let header = stripe_header("whsec_test", payload, now.timestamp());
        assert!(
            verify_stripe_signature("whsec_test", payload, &header, now, STRIPE_TOLERANCE).is_ok()
        );
    }

    #[test]
    fn test_stripe_signature_stale_timestamp() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let payload = "{}";
        let header = stripe_header("whsec_test", payload, now.timestamp() - 301);
        let err = verify_stripe_signature("whsec_test", payload, &header, now, STRIPE_TOLERANCE)
            .unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp { skew_secs: 301 }));
    }

    #[test]
    fn test_stripe_signature_wrong_secret() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let payload = "{}";
        let header = stripe_header("whsec_other", payload, now.timestamp());
        assert!(
            verify_stripe_signature("whsec_test", payload, &header, now, STRIPE_TOLERANCE)
                .is_err()
        );
    }

    #[test]
    fn test_stripe_header_parsing() {
        let parsed = parse_stripe_signature("t=1700000000,v1=abc123,v1=def456,v0=ignored").unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000);
        assert_eq!(parsed.v1_signatures, vec!["abc123", "def456"]);

        assert!(parse_stripe_signature("v1=abc").is_err());
        assert!(parse_stripe_signature("t=123").is_err());
    }

    #[test]
    fn test_replay_deduplicated() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let processor = WebhookProcessor::new(store.clone(), kv);

        let first = processor
            .record_stripe_event("evt_1", "checkout.session.completed", clock.now())
            .unwrap();
        assert_eq!(first, WebhookOutcome::Processed);

        let replay = processor
            .record_stripe_event("evt_1", "checkout.session.completed", clock.now())
            .unwrap();
        assert_eq!(replay, WebhookOutcome::Deduplicated);

        // A different event id processes normally.
        let other = processor
            .record_stripe_event("evt_2", "invoice.paid", clock.now())
            .unwrap();
        assert_eq!(other, WebhookOutcome::Processed);
    }

    #[test]
    fn test_store_backstop_when_cache_cold() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let processor = WebhookProcessor::new(store.clone(), kv.clone());

        processor
            .record_stripe_event("evt_9", "invoice.paid", clock.now())
            .unwrap();
        // Simulate the dedupe key expiring while the ledger row remains.
        clock.advance(Duration::from_secs(3700));
        let replay = processor
            .record_stripe_event("evt_9", "invoice.paid", clock.now())
            .unwrap();
        assert_eq!(replay, WebhookOutcome::Deduplicated);
    }
}
