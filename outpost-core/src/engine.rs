//! Engine assembly — wires the store, KV, adapters, publisher, scheduler,
//! automation runtime, and control plane from one configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::facebook::FacebookAdapter;
use crate::adapters::instagram::InstagramAdapter;
use crate::adapters::linkedin::LinkedInAdapter;
use crate::adapters::pinterest::PinterestAdapter;
use crate::adapters::threads::ThreadsAdapter;
use crate::adapters::tiktok::TikTokAdapter;
use crate::adapters::website::WebsiteAdapter;
use crate::adapters::x::XAdapter;
use crate::adapters::AdapterRegistry;
use crate::automation::generator::{OpenAiGenerator, RetryingGenerator};
use crate::automation::AutomationRuntime;
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::control::{ControlPlane, FeatureFlags};
use crate::credentials::CredentialVault;
use crate::encryption::TokenCipher;
use crate::error::{ConfigError, OutpostError, Result};
use crate::kv::{Kv, MemoryKv, RedisKv};
use crate::publisher::Publisher;
use crate::queue::Queues;
use crate::scheduler::{Heartbeat, Scheduler};
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::webhook::WebhookProcessor;
use crate::worker::Worker;

const BASELINE_COLLECTION_EVERY: Duration = Duration::from_secs(600);

/// Fully wired engine.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub kv: Arc<dyn Kv>,
    pub clock: SharedClock,
    pub queues: Arc<Queues>,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<AdapterRegistry>,
    pub publisher: Arc<Publisher>,
    pub scheduler: Arc<Scheduler>,
    pub runtime: Arc<AutomationRuntime>,
    pub control: Arc<ControlPlane>,
    pub worker: Arc<Worker>,
    pub heartbeat: Arc<Heartbeat>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl Engine {
    /// Build from configuration, opening the configured backends.
    pub fn from_config(config: EngineConfig) -> Result<Arc<Self>> {
        let clock: SharedClock = Arc::new(SystemClock);
        let store: Arc<dyn Store> = match config.store.backend.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            "sqlite" => Arc::new(SqliteStore::open(&config.store.database_path)?),
            other => {
                return Err(OutpostError::Config(ConfigError::Invalid {
                    message: format!("unknown store backend '{other}'"),
                }));
            }
        };
        let kv: Arc<dyn Kv> = match config.kv.backend.as_str() {
            "memory" => Arc::new(MemoryKv::new(clock.clone())),
            "redis" => Arc::new(RedisKv::connect(&config.kv.redis_url)?),
            other => {
                return Err(OutpostError::Config(ConfigError::Invalid {
                    message: format!("unknown kv backend '{other}'"),
                }));
            }
        };
        Self::assemble(config, store, kv, clock)
    }

    /// Wire the engine over externally supplied backends; used by embedded
    /// deployments and the test suite.
    pub fn assemble(
        config: EngineConfig,
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        let queues = Arc::new(Queues::in_memory(clock.clone(), kv.clone()));
        let vault = Arc::new(CredentialVault::new(
            store.clone(),
            kv.clone(),
            TokenCipher::from_secret(&config.security.encryption_key),
        ));

        let mut registry = AdapterRegistry::new(vault.clone(), kv.clone());
        registry.register(Box::new(WebsiteAdapter::new(store.clone(), clock.clone())));
        registry.register(Box::new(LinkedInAdapter::new(
            vault.clone(),
            config.providers.linkedin.clone(),
            clock.clone(),
        )));
        registry.register(Box::new(FacebookAdapter::new(
            vault.clone(),
            config.providers.meta.clone(),
            clock.clone(),
        )));
        registry.register(Box::new(InstagramAdapter::new(
            vault.clone(),
            config.providers.meta.clone(),
            clock.clone(),
        )));
        registry.register(Box::new(TikTokAdapter::new(
            vault.clone(),
            config.providers.tiktok.clone(),
            clock.clone(),
        )));
        registry.register(Box::new(ThreadsAdapter::new(vault.clone(), clock.clone())));
        registry.register(Box::new(XAdapter::new(
            vault.clone(),
            config.providers.x.clone(),
            clock.clone(),
        )));
        registry.register(Box::new(PinterestAdapter::new(
            vault.clone(),
            config.providers.pinterest.clone(),
            clock.clone(),
        )));
        let registry = Arc::new(registry);

        let publisher = Arc::new(Publisher::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            registry.clone(),
            vault.clone(),
            queues.publishing.clone(),
            config.publisher.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            queues.publishing.clone(),
            queues.scheduler.clone(),
            config.beats.clone(),
        ));

        let generator = RetryingGenerator::new(
            Arc::new(OpenAiGenerator::new(config.automation.generator.clone())),
            config.automation.generation_max_retries,
        );
        let runtime_flags = FeatureFlags::new(
            store.clone(),
            kv.clone(),
            Duration::from_secs(config.control.flag_cache_ttl_secs.max(10)),
        );
        let runtime = Arc::new(AutomationRuntime::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            generator,
            runtime_flags,
            queues.publishing.clone(),
            queues.analytics.clone(),
            config.automation.clone(),
        ));

        let control = Arc::new(ControlPlane::new(
            store.clone(),
            kv.clone(),
            config.control.clone(),
            config.risk.clone(),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            kv.clone(),
            config.control.worker_heartbeat_key.clone(),
            Duration::from_secs(config.beats.heartbeat_ttl_secs),
        ));
        let worker = Arc::new(Worker::new(
            queues.clone(),
            publisher.clone(),
            runtime.clone(),
            heartbeat.clone(),
            clock.clone(),
            config.publisher.clone(),
            config.beats.clone(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(store.clone(), kv.clone()));

        Ok(Arc::new(Self {
            config,
            store,
            kv,
            clock,
            queues,
            vault,
            registry,
            publisher,
            scheduler,
            runtime,
            control,
            worker,
            heartbeat,
            webhooks,
        }))
    }

    /// One-time startup work: seed the known feature flags.
    pub fn bootstrap(&self) -> Result<()> {
        self.control.flags.bootstrap(self.clock.now())?;
        info!("engine bootstrap complete");
        Ok(())
    }

    /// Periodic control-plane beats: auto-recovery + platform guardrails,
    /// baseline collection, and the monthly usage reset.
    async fn run_ops(self: Arc<Self>, cancel: CancellationToken) {
        let recovery_every = Duration::from_secs(self.config.beats.auto_recovery_secs.max(10));
        let usage_reset_every =
            Duration::from_secs(self.config.beats.usage_reset_hours.max(1) * 3600);
        let mut last_baselines = std::time::Instant::now();
        let mut last_usage_reset = std::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(recovery_every) => {}
            }
            let now = self.clock.now();
            match self.control.system_health(now) {
                Ok(health) => {
                    if let Err(err) = self.control.evaluate_platform_guardrails(&health, now) {
                        warn!(error = %err, "platform guardrail evaluation failed");
                    }
                }
                Err(err) => warn!(error = %err, "health computation failed"),
            }
            if let Err(err) = self.control.auto_recovery(&self.heartbeat, now) {
                warn!(error = %err, "auto-recovery pass failed");
            }
            if last_baselines.elapsed() >= BASELINE_COLLECTION_EVERY {
                if let Err(err) = self.control.collect_performance_baselines(now) {
                    warn!(error = %err, "baseline collection failed");
                }
                last_baselines = std::time::Instant::now();
            }
            if last_usage_reset.elapsed() >= usage_reset_every {
                match crate::billing::reset_usage_for_new_period(self.store.as_ref(), now) {
                    Ok(reset) => info!(tenants = reset, "usage reset pass complete"),
                    Err(err) => warn!(error = %err, "usage reset failed"),
                }
                last_usage_reset = std::time::Instant::now();
            }
        }
    }

    /// Run scheduler, worker, and ops loops until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let scheduler = self.scheduler.clone().run(cancel.clone());
        let worker = self.worker.clone().run(cancel.clone());
        let ops = self.clone().run_ops(cancel.clone());
        tokio::join!(scheduler, worker, ops);
    }
}
