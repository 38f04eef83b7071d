//! # Outpost Core
//!
//! Core library for the Outpost publishing engine: the scheduler,
//! publishing workers, automation runtime, and control plane of a
//! multi-tenant social-publishing platform. Persistence lives behind the
//! [`store::Store`] trait (sqlite or in-memory), fast state behind
//! [`kv::Kv`] (redis or in-memory), and per-channel delivery behind the
//! [`adapters::ChannelAdapter`] registry.

pub mod adapters;
pub mod automation;
pub mod billing;
pub mod clock;
pub mod config;
pub mod control;
pub mod credentials;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod events;
pub mod kv;
pub mod publisher;
pub mod queue;
pub mod risk;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod webhook;
pub mod worker;

// Re-export commonly used types at the crate root.
pub use adapters::{AdapterRegistry, ChannelAdapter, PublishContext, PublishOutcome};
pub use automation::{AutomationRuntime, RunOutcome, cancel_run};
pub use clock::{Clock, Deadline, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use control::{Breakers, ConnectorHealth, ControlPlane, FeatureFlags, SystemHealthScore};
pub use credentials::{CredentialVault, DecryptedCredential};
pub use encryption::TokenCipher;
pub use engine::Engine;
pub use error::{AdapterError, OutpostError, Result, StoreError};
pub use kv::{Kv, MemoryKv, RedisKv};
pub use publisher::{PublishDisposition, PublishReport, Publisher};
pub use queue::{Job, JobQueue, MemoryQueue, Queues};
pub use scheduler::{Heartbeat, Scheduler};
pub use store::{MemoryStore, SqliteStore, Store};
pub use types::{ChannelId, ChannelKind, PostId, ProjectId, RuleId, RunId, TenantId};
pub use tokio_util::sync::CancellationToken;
pub use webhook::{WebhookOutcome, WebhookProcessor};
pub use worker::Worker;
