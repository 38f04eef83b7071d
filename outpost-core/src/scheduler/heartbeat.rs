//! Worker heartbeat — a TTL key refreshed on every beat.
//!
//! Auto-recovery raises an incident when the key goes missing, which means
//! no worker has beaten within the TTL.

use std::sync::Arc;
use std::time::Duration;

use crate::error::KvError;
use crate::kv::Kv;

pub struct Heartbeat {
    kv: Arc<dyn Kv>,
    key: String,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(kv: Arc<dyn Kv>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            key: key.into(),
            ttl,
        }
    }

    /// Refresh the heartbeat key.
    pub fn beat(&self) -> Result<(), KvError> {
        self.kv.set_ex(&self.key, "1", self.ttl)
    }

    /// Whether any worker has beaten within the TTL.
    pub fn is_alive(&self) -> bool {
        self.kv.get(&self.key).ok().flatten().is_some()
    }
}
