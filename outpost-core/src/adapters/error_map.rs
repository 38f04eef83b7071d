//! Provider error normalization.
//!
//! Classifies raw provider errors into a small category set with a
//! retryable bit and an operator-facing suggested action. The normalized
//! form is recorded on `ChannelPublishFailed` event metadata and feeds
//! connector health scoring.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Category of a normalized provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    ContentRejected,
    ServerError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::ContentRejected => "content_rejected",
            Self::ServerError => "server_error",
        }
    }
}

/// Provider error reduced to a category + recovery hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedProviderError {
    pub provider: String,
    pub error_code: String,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub suggested_action: String,
}

impl NormalizedProviderError {
    /// Shape stored under `metadata.normalized_error` on failure events.
    pub fn to_metadata(&self) -> Value {
        json!({
            "provider": self.provider,
            "error_code": self.error_code,
            "category": self.category.as_str(),
            "retryable": self.retryable,
            "suggested_action": self.suggested_action,
        })
    }
}

fn code_has_any(code: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|token| code.contains(token))
}

/// Map a raw `(provider, code, message)` triple into a normalized error.
pub fn map_provider_error(
    provider: &str,
    error_code: Option<&str>,
    message: &str,
) -> NormalizedProviderError {
    let provider = provider.trim().to_lowercase();
    let code = error_code.unwrap_or("unknown_error").trim().to_lowercase();
    let text = message.to_lowercase();

    if code_has_any(&code, &["auth", "token", "invalid_grant"]) || text.contains("unauthorized") {
        return NormalizedProviderError {
            provider,
            error_code: code,
            category: ErrorCategory::Auth,
            retryable: false,
            suggested_action: "Reconnect connector and refresh credentials".to_string(),
        };
    }
    if code_has_any(&code, &["rate", "throttle", "too_many_requests"])
        || text.contains("rate limit")
        || text.contains("too many requests")
        || text.starts_with("429")
    {
        return NormalizedProviderError {
            provider,
            error_code: code,
            category: ErrorCategory::RateLimit,
            retryable: true,
            suggested_action: "Wait for cooldown and retry with backoff".to_string(),
        };
    }
    if code_has_any(&code, &["content", "policy", "rejected"]) {
        return NormalizedProviderError {
            provider,
            error_code: code,
            category: ErrorCategory::ContentRejected,
            retryable: false,
            suggested_action: "Adjust content to platform policy and retry".to_string(),
        };
    }
    if code_has_any(&code, &["server", "timeout", "unavailable", "network"]) {
        return NormalizedProviderError {
            provider,
            error_code: code,
            category: ErrorCategory::ServerError,
            retryable: true,
            suggested_action: "Retry later; provider instability detected".to_string(),
        };
    }

    NormalizedProviderError {
        provider,
        error_code: code,
        category: ErrorCategory::ServerError,
        retryable: true,
        suggested_action: "Retry later and inspect provider diagnostics".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_by_code_token() {
        let normalized = map_provider_error("linkedin", Some("INVALID_TOKEN"), "expired");
        assert_eq!(normalized.category, ErrorCategory::Auth);
        assert!(!normalized.retryable);
        assert_eq!(normalized.provider, "linkedin");
        assert_eq!(normalized.error_code, "invalid_token");
    }

    #[test]
    fn test_auth_by_message() {
        let normalized = map_provider_error("x", None, "401 Unauthorized");
        assert_eq!(normalized.category, ErrorCategory::Auth);
    }

    #[test]
    fn test_rate_limit() {
        let normalized = map_provider_error("pinterest", Some("too_many_requests"), "slow down");
        assert_eq!(normalized.category, ErrorCategory::RateLimit);
        assert!(normalized.retryable);

        let by_message = map_provider_error("tiktok", None, "Rate limit exceeded");
        assert_eq!(by_message.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn test_content_rejected() {
        let normalized = map_provider_error("facebook", Some("policy_violation"), "blocked");
        assert_eq!(normalized.category, ErrorCategory::ContentRejected);
        assert!(!normalized.retryable);
    }

    #[test]
    fn test_server_error_and_fallback() {
        let timeout = map_provider_error("threads", Some("gateway_timeout"), "504");
        assert_eq!(timeout.category, ErrorCategory::ServerError);
        assert!(timeout.retryable);

        let unknown = map_provider_error("instagram", Some("weird_code"), "???");
        assert_eq!(unknown.category, ErrorCategory::ServerError);
        assert!(unknown.retryable);
        assert!(unknown.suggested_action.contains("diagnostics"));
    }

    #[test]
    fn test_metadata_shape() {
        let normalized = map_provider_error("linkedin", Some("rate_limited"), "429");
        let metadata = normalized.to_metadata();
        assert_eq!(metadata["category"], "rate_limit");
        assert_eq!(metadata["retryable"], true);
        assert_eq!(metadata["provider"], "linkedin");
    }
}
