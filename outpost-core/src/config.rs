//! Configuration system for the Outpost engine.
//!
//! Uses `figment` for layered configuration: defaults -> `outpost.toml` ->
//! `OUTPOST_`-prefixed environment variables. Nested fields are addressed
//! with double underscores, e.g. `OUTPOST_KV__REDIS_URL`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for the engine and its collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub kv: KvConfig,
    pub beats: BeatsConfig,
    pub publisher: PublisherConfig,
    pub automation: AutomationConfig,
    pub risk: RiskConfig,
    pub control: ControlConfig,
    pub security: SecurityConfig,
    pub providers: ProvidersConfig,
    pub billing: BillingConfig,
    /// Operator addresses notified on critical incidents.
    #[serde(default)]
    pub platform_admin_emails: Vec<String>,
}

/// SQL store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite` or `memory`.
    pub backend: String,
    /// Database path for the sqlite backend.
    pub database_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            database_path: "outpost.db".to_string(),
        }
    }
}

/// KV substrate backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// `redis` or `memory`.
    pub backend: String,
    pub redis_url: String,
    /// Per-call deadline for KV operations.
    pub op_timeout_secs: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            op_timeout_secs: 1,
        }
    }
}

/// Periodic beat intervals for the scheduler and ops passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatsConfig {
    pub due_posts_secs: u64,
    pub time_rules_secs: u64,
    pub event_rules_secs: u64,
    pub heartbeat_secs: u64,
    pub heartbeat_ttl_secs: u64,
    pub auto_recovery_secs: u64,
    pub usage_reset_hours: u64,
    /// Fractional jitter applied to every beat.
    pub jitter_frac: f64,
}

impl Default for BeatsConfig {
    fn default() -> Self {
        Self {
            due_posts_secs: 30,
            time_rules_secs: 30,
            event_rules_secs: 20,
            heartbeat_secs: 15,
            heartbeat_ttl_secs: 45,
            auto_recovery_secs: 60,
            usage_reset_hours: 24,
            jitter_frac: 0.1,
        }
    }
}

/// Publisher delivery and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Consecutive channel failures before the connector breaker trips.
    pub consecutive_failure_threshold: u32,
    pub default_max_attempts: u32,
    pub default_retry_delay_secs: u64,
    pub adapter_timeout_secs: u64,
    /// Total wall budget for one publish job.
    pub job_wall_budget_secs: u64,
    /// Per-post lock TTL; must exceed the job wall budget.
    pub lock_ttl_secs: u64,
    /// Grace given to an in-flight adapter call on shutdown.
    pub shutdown_grace_secs: u64,
    pub default_requests_per_minute: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            default_max_attempts: 5,
            default_retry_delay_secs: 30,
            adapter_timeout_secs: 25,
            job_wall_budget_secs: 120,
            lock_ttl_secs: 180,
            shutdown_grace_secs: 30,
            default_requests_per_minute: 120,
        }
    }
}

/// Automation runtime and content generation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub run_timeout_secs: u64,
    pub generation_max_retries: u32,
    pub generator: GeneratorConfig,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 120,
            generation_max_retries: 2,
            generator: GeneratorConfig::default(),
        }
    }
}

/// OpenAI-compatible content generator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub default_language: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            temperature: 0.4,
            default_language: "en".to_string(),
        }
    }
}

/// Tenant risk enforcement thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Risk score at which high-impact writes require manual approval.
    pub manual_approval_threshold: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            manual_approval_threshold: 80,
        }
    }
}

/// Control-plane thresholds and cache TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Rolling publish failure rate that trips the global breaker.
    pub publish_failure_alert_threshold: f64,
    pub worker_backlog_alert_threshold: u64,
    pub db_latency_alert_ms: f64,
    pub flag_cache_ttl_secs: u64,
    pub worker_heartbeat_key: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            publish_failure_alert_threshold: 0.08,
            worker_backlog_alert_threshold: 200,
            db_latency_alert_ms: 120.0,
            flag_cache_ttl_secs: 30,
            worker_heartbeat_key: "platform:worker:heartbeat".to_string(),
        }
    }
}

/// Process secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key material for the token cipher; the cipher key is derived from
    /// this via SHA-256, so any non-empty string works.
    pub encryption_key: String,
    pub jwt_secret: String,
}

/// Per-provider OAuth application credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub linkedin: OauthClientConfig,
    pub meta: OauthClientConfig,
    pub tiktok: OauthClientConfig,
    pub threads: OauthClientConfig,
    pub x: OauthClientConfig,
    pub pinterest: OauthClientConfig,
    /// Webhook signing secrets keyed by provider name.
    #[serde(default)]
    pub webhook_secrets: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OauthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl OauthClientConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// Billing collaborator view knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub grace_period_days: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults -> optional TOML file -> environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("outpost.toml"));
        }
        let config: EngineConfig = figment
            .merge(Env::prefixed("OUTPOST_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would violate engine invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.lock_ttl_secs <= self.publisher.job_wall_budget_secs {
            return Err(ConfigError::Invalid {
                message: format!(
                    "publisher.lock_ttl_secs ({}) must exceed job_wall_budget_secs ({})",
                    self.publisher.lock_ttl_secs, self.publisher.job_wall_budget_secs
                ),
            });
        }
        if self.beats.heartbeat_ttl_secs <= self.beats.heartbeat_secs {
            return Err(ConfigError::Invalid {
                message: "beats.heartbeat_ttl_secs must exceed beats.heartbeat_secs".to_string(),
            });
        }
        if !matches!(self.store.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::Invalid {
                message: format!("unknown store backend '{}'", self.store.backend),
            });
        }
        if !matches!(self.kv.backend.as_str(), "redis" | "memory") {
            return Err(ConfigError::Invalid {
                message: format!("unknown kv backend '{}'", self.kv.backend),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.beats.due_posts_secs, 30);
        assert_eq!(config.beats.event_rules_secs, 20);
        assert_eq!(config.beats.heartbeat_secs, 15);
        assert_eq!(config.publisher.consecutive_failure_threshold, 5);
        assert!((config.control.publish_failure_alert_threshold - 0.08).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lock_ttl_must_exceed_wall_budget() {
        let mut config = EngineConfig::default();
        config.publisher.lock_ttl_secs = 60;
        config.publisher.job_wall_budget_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = EngineConfig::default();
        config.store.backend = "dynamodb".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dynamodb"));
    }

    #[test]
    fn test_oauth_client_configured() {
        let mut client = OauthClientConfig::default();
        assert!(!client.is_configured());
        client.client_id = "abc".into();
        client.client_secret = "xyz".into();
        assert!(client.is_configured());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.store.backend, "sqlite");
        assert_eq!(restored.kv.redis_url, config.kv.redis_url);
    }
}
