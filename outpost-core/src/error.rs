//! Error types for the Outpost publishing engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the store, KV substrate, adapters, scheduler, automation, and
//! control-plane domains.

/// Top-level error type for the Outpost core library.
#[derive(Debug, thiserror::Error)]
pub enum OutpostError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Publishing is paused by the global circuit breaker: {reason}")]
    GlobalBreakerOpen { reason: String },

    #[error("Publishing is paused for tenant {tenant_id} by the tenant circuit breaker: {reason}")]
    TenantBreakerOpen { tenant_id: String, reason: String },

    #[error("Platform rate limit exceeded for {platform}, retry after {retry_after_secs}s")]
    RateLimited {
        platform: String,
        retry_after_secs: u64,
    },

    #[error("Plan limit exceeded: {used} of {limit} posts this period")]
    PlanLimitExceeded { used: u64, limit: u64 },

    #[error("Write blocked by tenant risk controls: risk score {risk_score} >= {threshold}")]
    RiskBlocked { risk_score: u32, threshold: u32 },

    #[error("Maintenance read-only mode is active")]
    MaintenanceMode,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the transactional SQL store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {constraint}")]
    Conflict { constraint: String },

    #[error("Row not found: {entity}")]
    NotFound { entity: String },

    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Store backend error: {message}")]
    Backend { message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref message) = err {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict {
                    constraint: message.clone().unwrap_or_else(|| "unknown".to_string()),
                };
            }
        }
        StoreError::Backend {
            message: err.to_string(),
        }
    }
}

/// Errors from the KV substrate.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("KV backend error: {message}")]
    Backend { message: String },

    #[error("KV operation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Backend {
            message: err.to_string(),
        }
    }
}

/// Errors raised by channel adapters during delivery.
///
/// The variant determines the publisher's recovery policy: `Auth` marks the
/// credential and permanent-fails the channel, `Retryable` schedules a
/// backoff retry, `Permanent` fails the channel without retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("Adapter auth error for {channel_type}: {message}")]
    Auth {
        channel_type: String,
        message: String,
    },

    #[error("Adapter retryable error for {channel_type}: {message}")]
    Retryable {
        channel_type: String,
        message: String,
    },

    #[error("Adapter permanent error for {channel_type}: {message}")]
    Permanent {
        channel_type: String,
        message: String,
    },

    #[error("No adapter registered for channel type '{channel_type}'")]
    Unsupported { channel_type: String },
}

impl AdapterError {
    /// Whether the publisher may retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Retryable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            AdapterError::Auth { message, .. }
            | AdapterError::Retryable { message, .. }
            | AdapterError::Permanent { message, .. } => message,
            AdapterError::Unsupported { channel_type } => channel_type,
        }
    }
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No credential stored for connector {connector_type}")]
    Missing { connector_type: String },

    #[error("Credential for connector {connector_type} is revoked")]
    Revoked { connector_type: String },

    #[error("Encryption failed: {message}")]
    EncryptFailed { message: String },

    #[error("Decryption failed: {message}")]
    DecryptFailed { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the scheduler loops.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression {
        expression: String,
        message: String,
    },

    #[error("Failed to enqueue job for post {post_id} after retries: {message}")]
    EnqueueFailed { post_id: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("KV error: {0}")]
    Kv(#[from] KvError),
}

/// Errors from the automation runtime.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Automation run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Automation rule not found: {rule_id}")]
    RuleNotFound { rule_id: String },

    #[error("Run {run_id} is already in terminal state {status}")]
    TerminalState { run_id: String, status: String },

    #[error("Unsupported template type for action: {template_type}")]
    UnsupportedTemplateType { template_type: String },

    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: String },

    #[error("Run deadline exceeded after {budget_secs}s")]
    DeadlineExceeded { budget_secs: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),
}

/// Errors from the content generation contract.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generator request failed: {message}")]
    Request { message: String },

    #[error("Generator output failed validation: {message}")]
    Validation { message: String },

    #[error("Generation failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("Generator is not configured: {message}")]
    NotConfigured { message: String },
}

/// Errors from the work queues.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue '{queue}' is closed")]
    Closed { queue: String },

    #[error("Queue backend error: {message}")]
    Backend { message: String },
}

/// Errors from inbound webhook processing.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Signature verification failed for provider {provider}")]
    InvalidSignature { provider: String },

    #[error("Signature timestamp outside tolerance: skew {skew_secs}s")]
    StaleTimestamp { skew_secs: i64 },

    #[error("Malformed webhook payload: {message}")]
    Malformed { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `OutpostError`.
pub type Result<T> = std::result::Result<T, OutpostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_adapter() {
        let err = OutpostError::Adapter(AdapterError::Auth {
            channel_type: "linkedin".into(),
            message: "token expired".into(),
        });
        assert_eq!(
            err.to_string(),
            "Adapter error: Adapter auth error for linkedin: token expired"
        );
    }

    #[test]
    fn test_adapter_error_retryable() {
        let retryable = AdapterError::Retryable {
            channel_type: "x".into(),
            message: "HTTP 503".into(),
        };
        assert!(retryable.is_retryable());

        let permanent = AdapterError::Permanent {
            channel_type: "x".into(),
            message: "policy violation".into(),
        };
        assert!(!permanent.is_retryable());

        let auth = AdapterError::Auth {
            channel_type: "x".into(),
            message: "revoked".into(),
        };
        assert!(!auth.is_retryable());
    }

    #[test]
    fn test_error_display_breaker() {
        let err = OutpostError::GlobalBreakerOpen {
            reason: "elevated failure rate".into(),
        };
        assert_eq!(
            err.to_string(),
            "Publishing is paused by the global circuit breaker: elevated failure rate"
        );
    }

    #[test]
    fn test_error_display_risk_blocked() {
        let err = OutpostError::RiskBlocked {
            risk_score: 84,
            threshold: 80,
        };
        assert_eq!(
            err.to_string(),
            "Write blocked by tenant risk controls: risk score 84 >= 80"
        );
    }

    #[test]
    fn test_store_conflict_display() {
        let err = StoreError::Conflict {
            constraint: "uq_channel_publications_tenant_post_channel".into(),
        };
        assert!(err.to_string().contains("uq_channel_publications"));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: OutpostError = serde_err.into();
        assert!(matches!(err, OutpostError::Serialization(_)));
    }
}
