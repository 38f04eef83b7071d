//! Shared HTTP plumbing for provider adapters.
//!
//! One client with a per-adapter timeout; response status classification
//! into the adapter error taxonomy (401/403 auth, 429/5xx retryable, other
//! 4xx permanent).

use std::time::Duration;

use reqwest::StatusCode;

use crate::error::AdapterError;
use crate::types::ChannelKind;

/// Build the shared client used by provider adapters.
pub fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("outpost/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

fn truncate(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Map an error response status + body into the adapter taxonomy.
pub fn classify_status(kind: ChannelKind, status: StatusCode, body: &str) -> AdapterError {
    let channel_type = kind.to_string();
    let message = format!("{} {}", status.as_u16(), truncate(body, 500));
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AdapterError::Auth {
            channel_type,
            message,
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AdapterError::Retryable {
            channel_type,
            message,
        }
    } else {
        AdapterError::Permanent {
            channel_type,
            message,
        }
    }
}

/// Map a transport-level failure (timeout, connect, body read) into the
/// adapter taxonomy. Transport failures are always retryable.
pub fn transport_error(kind: ChannelKind, err: reqwest::Error) -> AdapterError {
    AdapterError::Retryable {
        channel_type: kind.to_string(),
        message: err.to_string(),
    }
}

/// Credential missing or unusable before any request was made.
pub fn missing_credential(kind: ChannelKind, detail: &str) -> AdapterError {
    AdapterError::Auth {
        channel_type: kind.to_string(),
        message: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_statuses() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = classify_status(ChannelKind::LinkedIn, status, "denied");
            assert!(matches!(err, AdapterError::Auth { .. }), "{status}");
        }
    }

    #[test]
    fn test_classify_retryable_statuses() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = classify_status(ChannelKind::X, status, "try later");
            assert!(err.is_retryable(), "{status}");
        }
    }

    #[test]
    fn test_classify_permanent_statuses() {
        let err = classify_status(ChannelKind::Facebook, StatusCode::BAD_REQUEST, "bad field");
        assert!(matches!(err, AdapterError::Permanent { .. }));
        assert!(err.message().contains("400"));
    }

    #[test]
    fn test_body_truncated_in_message() {
        let long_body = "x".repeat(2000);
        let err = classify_status(ChannelKind::TikTok, StatusCode::BAD_REQUEST, &long_body);
        assert!(err.message().len() < 600);
    }
}
