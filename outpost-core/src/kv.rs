//! KV substrate — ephemeral locks, windowed counters, cursors, heartbeats,
//! breaker flags, dedupe keys, and bounded perf-sample lists.
//!
//! Two implementations: `MemoryKv` (clock-aware TTLs, used in tests and
//! embedded mode) and `RedisKv`. Failure policy is decided by callers:
//! rate limits and the feature-flag cache fail open on KV errors, webhook
//! dedupe treats an error as not-deduplicated and relies on the store's
//! unique constraint as the backstop.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Commands;

use crate::clock::SharedClock;
use crate::error::KvError;

/// Key-value operations required by the engine.
pub trait Kv: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;
    /// Set only if the key does not exist; returns whether the key was set.
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;
    fn delete(&self, key: &str) -> Result<(), KvError>;
    fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError>;
    /// Increment a counter, returning the new value.
    fn incr(&self, key: &str) -> Result<i64, KvError>;
    fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
    /// Remaining TTL, `None` when the key is missing or has no expiry.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;
    /// Push to the head of a list and trim it to `max_len` entries.
    fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), KvError>;
    fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError>;
    fn list_len(&self, key: &str) -> Result<u64, KvError>;
}

/// Canonical key names shared by the engine components.
pub mod keys {
    use crate::types::{ChannelId, TenantId};
    use chrono::{DateTime, Utc};

    pub const GLOBAL_PUBLISH_BREAKER: &str = "platform:breaker:global_publish";
    pub const EVENT_RULE_CURSOR: &str = "automation:event_rules:last_publish_event_at";

    pub fn global_breaker_reason() -> String {
        format!("{GLOBAL_PUBLISH_BREAKER}:reason")
    }

    pub fn tenant_breaker(tenant_id: TenantId) -> String {
        format!("platform:breaker:tenant:{tenant_id}")
    }

    pub fn tenant_breaker_reason(tenant_id: TenantId) -> String {
        format!("platform:breaker:tenant:{tenant_id}:reason")
    }

    pub fn tenant_throttle(tenant_id: TenantId) -> String {
        format!("tenant:throttle:{tenant_id}")
    }

    pub fn tenant_rate_limit_violations(tenant_id: TenantId) -> String {
        format!("tenant:rate_limit_violations:{tenant_id}")
    }

    pub fn post_lock(tenant_id: TenantId, post_id: crate::types::PostId) -> String {
        format!("publish_lock:{tenant_id}:{post_id}")
    }

    pub fn credential_refresh_lock(tenant_id: TenantId, connector: &str) -> String {
        format!("credential_refresh:{tenant_id}:{connector}")
    }

    pub fn connector_backoff(channel_id: ChannelId) -> String {
        format!("connector_backoff:{channel_id}")
    }

    pub fn connector_cooldown(channel_id: ChannelId) -> String {
        format!("connector_health_cooldown:{channel_id}")
    }

    pub fn connector_sandbox(channel_id: ChannelId) -> String {
        format!("connector_sandbox:{channel_id}")
    }

    pub fn platform_rate_limit(platform: &str, minute: DateTime<Utc>) -> String {
        format!("platform_rate_limit:{platform}:{}", minute.format("%Y%m%d%H%M"))
    }

    pub fn webhook_dedupe(provider: &str, event_id: &str) -> String {
        format!("webhook_dedupe:{provider}:{event_id}")
    }

    pub fn run_cancel(run_id: crate::types::RunId) -> String {
        format!("automation_run_cancel:{run_id}")
    }

    pub fn feature_flag_cache(tenant_id: Option<TenantId>) -> String {
        match tenant_id {
            Some(id) => format!("feature_flags:{id}"),
            None => "feature_flags:global".to_string(),
        }
    }

    pub const FEATURE_FLAG_CACHE_PREFIX: &str = "feature_flags:";

    pub fn perf_samples(metric_name: &str) -> String {
        format!("platform:perf:{metric_name}")
    }

    pub fn queue_depth(queue: &str) -> String {
        format!("queue_depth:{queue}")
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    lists: HashMap<String, Vec<String>>,
}

/// In-memory KV with clock-driven TTLs, used in tests and embedded mode.
pub struct MemoryKv {
    clock: SharedClock,
    state: Mutex<MemoryState>,
}

impl MemoryKv {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn live_value(&self, state: &MemoryState, key: &str) -> Option<String> {
        let entry = state.entries.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if self.clock.now() >= expires_at {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or_default()
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let state = self.state.lock().unwrap();
        Ok(self.live_value(&state, key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let expires_at = Some(self.expiry(ttl));
        let mut state = self.state.lock().unwrap();
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut state = self.state.lock().unwrap();
        if self.live_value(&state, key).is_some() {
            return Ok(false);
        }
        let expires_at = Some(self.expiry(ttl));
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - state.entries.len()) as u64)
    }

    fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut state = self.state.lock().unwrap();
        let (current, expires_at) = match state.entries.get(key) {
            Some(entry) => {
                let live = entry
                    .expires_at
                    .map(|at| self.clock.now() < at)
                    .unwrap_or(true);
                if live {
                    (
                        entry.value.parse::<i64>().unwrap_or(0),
                        entry.expires_at,
                    )
                } else {
                    (0, None)
                }
            }
            None => (0, None),
        };
        let next = current + 1;
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let expires_at = self.expiry(ttl);
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires_at = Some(expires_at);
        }
        Ok(())
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let state = self.state.lock().unwrap();
        let Some(entry) = state.entries.get(key) else {
            return Ok(None);
        };
        let Some(expires_at) = entry.expires_at else {
            return Ok(None);
        };
        let remaining = expires_at - self.clock.now();
        Ok(remaining.to_std().ok().filter(|d| !d.is_zero()))
    }

    fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), KvError> {
        let mut state = self.state.lock().unwrap();
        let list = state.lists.entry(key.to_string()).or_default();
        list.insert(0, value.to_string());
        list.truncate(max_len);
        Ok(())
    }

    fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn list_len(&self, key: &str) -> Result<u64, KvError> {
        let state = self.state.lock().unwrap();
        Ok(state.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }
}

/// Redis-backed KV for production deployments.
pub struct RedisKv {
    client: redis::Client,
    connection: Mutex<Option<redis::Connection>>,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    /// Run `op` against a cached connection, dropping it on error so the
    /// next call reconnects.
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, KvError> {
        let mut slot = self.connection.lock().unwrap();
        if slot.is_none() {
            *slot = Some(self.client.get_connection()?);
        }
        let conn = slot.as_mut().expect("connection populated above");
        match op(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                *slot = None;
                Err(err.into())
            }
        }
    }
}

impl Kv for RedisKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.with_conn(|conn| conn.get(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.with_conn(|conn| conn.set(key, value))
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.with_conn(|conn| conn.set_ex(key, value, ttl.as_secs().max(1)))
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.with_conn(|conn| {
            let outcome: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query(conn)?;
            Ok(outcome.is_some())
        })
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.with_conn(|conn| conn.del(key))
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        self.with_conn(|conn| {
            let keys: Vec<String> = conn.keys(format!("{prefix}*"))?;
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: u64 = conn.del(keys)?;
            Ok(removed)
        })
    }

    fn incr(&self, key: &str) -> Result<i64, KvError> {
        self.with_conn(|conn| conn.incr(key, 1))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        self.with_conn(|conn| conn.expire(key, ttl.as_secs().max(1) as i64))
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let remaining: i64 = self.with_conn(|conn| conn.ttl(key))?;
        if remaining > 0 {
            Ok(Some(Duration::from_secs(remaining as u64)))
        } else {
            Ok(None)
        }
    }

    fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), KvError> {
        self.with_conn(|conn| {
            conn.lpush::<_, _, ()>(key, value)?;
            conn.ltrim(key, 0, max_len.saturating_sub(1) as isize)
        })
    }

    fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, KvError> {
        self.with_conn(|conn| conn.lrange(key, 0, limit.saturating_sub(1) as isize))
    }

    fn list_len(&self, key: &str) -> Result<u64, KvError> {
        self.with_conn(|conn| conn.llen(key))
    }
}
