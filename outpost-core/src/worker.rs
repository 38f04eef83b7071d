//! Publish worker loop — consumes the work queues, refreshes the
//! heartbeat, and shuts down gracefully.
//!
//! Every job runs under the per-job wall budget; exceeding it counts as a
//! retryable failure and the job is re-queued with a delay. On shutdown the
//! in-flight job gets a grace period to finish its current call, after
//! which the per-post lock TTL releases the work for re-dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::automation::AutomationRuntime;
use crate::clock::SharedClock;
use crate::config::{BeatsConfig, PublisherConfig};
use crate::publisher::Publisher;
use crate::queue::{Job, Queues};
use crate::scheduler::Heartbeat;

const IDLE_POLL: Duration = Duration::from_millis(250);
const WALL_BUDGET_RETRY_DELAY: Duration = Duration::from_secs(60);

pub struct Worker {
    queues: Arc<Queues>,
    publisher: Arc<Publisher>,
    runtime: Arc<AutomationRuntime>,
    heartbeat: Arc<Heartbeat>,
    clock: SharedClock,
    publisher_config: PublisherConfig,
    beats: BeatsConfig,
}

impl Worker {
    pub fn new(
        queues: Arc<Queues>,
        publisher: Arc<Publisher>,
        runtime: Arc<AutomationRuntime>,
        heartbeat: Arc<Heartbeat>,
        clock: SharedClock,
        publisher_config: PublisherConfig,
        beats: BeatsConfig,
    ) -> Self {
        Self {
            queues,
            publisher,
            runtime,
            heartbeat,
            clock,
            publisher_config,
            beats,
        }
    }

    fn next_job(&self) -> Option<Job> {
        let now = self.clock.now();
        for queue in [
            &self.queues.publishing,
            &self.queues.scheduler,
            &self.queues.analytics,
        ] {
            match queue.pop_ready(now) {
                Ok(Some(job)) => return Some(job),
                Ok(None) => continue,
                Err(err) => {
                    warn!(queue = queue.name(), error = %err, "queue pop failed");
                }
            }
        }
        None
    }

    async fn process(&self, job: Job) {
        match job {
            Job::Publish {
                tenant_id,
                post_id,
                attempt,
            } => {
                let wall_budget = Duration::from_secs(self.publisher_config.job_wall_budget_secs);
                let result = tokio::time::timeout(
                    wall_budget,
                    self.publisher.publish_post(tenant_id, post_id),
                )
                .await;
                match result {
                    Ok(Ok(report)) => {
                        info!(
                            %tenant_id,
                            %post_id,
                            attempt,
                            disposition = ?report.disposition,
                            "publish job finished"
                        );
                    }
                    Ok(Err(err)) => {
                        warn!(%tenant_id, %post_id, error = %err, "publish job errored");
                    }
                    Err(_) => {
                        // Wall budget exceeded: retryable failure, re-queue.
                        warn!(
                            %tenant_id,
                            %post_id,
                            budget_secs = wall_budget.as_secs(),
                            "publish job exceeded wall budget, re-queueing"
                        );
                        let _ = self.queues.publishing.enqueue_after(
                            Job::Publish {
                                tenant_id,
                                post_id,
                                attempt: attempt + 1,
                            },
                            WALL_BUDGET_RETRY_DELAY,
                        );
                    }
                }
            }
            Job::Automation { tenant_id, run_id } => {
                match self.runtime.execute_run(tenant_id, run_id).await {
                    Ok(outcome) => {
                        info!(%tenant_id, %run_id, outcome = ?outcome, "automation job finished");
                    }
                    Err(err) => {
                        warn!(%tenant_id, %run_id, error = %err, "automation job errored");
                    }
                }
            }
            Job::MetricsSync { tenant_id } => {
                // Metrics collection belongs to the analytics collaborator;
                // the queue entry exists so its worker can pick it up.
                info!(%tenant_id, "metrics sync job observed");
            }
        }
    }

    /// Main loop: beat, pop, process; on cancellation give the in-flight
    /// job a grace period before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let heartbeat_every = Duration::from_secs(self.beats.heartbeat_secs);
        let grace = Duration::from_secs(self.publisher_config.shutdown_grace_secs);
        let mut last_beat = std::time::Instant::now()
            .checked_sub(heartbeat_every)
            .unwrap_or_else(std::time::Instant::now);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if last_beat.elapsed() >= heartbeat_every {
                if let Err(err) = self.heartbeat.beat() {
                    warn!(error = %err, "heartbeat refresh failed");
                }
                last_beat = std::time::Instant::now();
            }

            let Some(job) = self.next_job() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            };

            let work = self.process(job);
            tokio::pin!(work);
            tokio::select! {
                _ = &mut work => {}
                _ = cancel.cancelled() => {
                    // Let the in-flight call finish within the grace window.
                    if tokio::time::timeout(grace, &mut work).await.is_err() {
                        warn!("in-flight job abandoned after shutdown grace; lock TTL will release it");
                    }
                    break;
                }
            }
        }
        info!("worker loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockAdapter;
    use crate::adapters::AdapterRegistry;
    use crate::automation::generator::{MockGenerator, RetryingGenerator};
    use crate::clock::{Clock, ManualClock};
    use crate::config::AutomationConfig;
    use crate::control::FeatureFlags;
    use crate::credentials::CredentialVault;
    use crate::encryption::TokenCipher;
    use crate::kv::MemoryKv;
    use crate::store::models::{
        Channel, ChannelCapabilities, Post, PostStatus, Project, Tenant,
    };
    use crate::store::{MemoryStore, Store};
    use crate::types::{ChannelKind, ProjectId, TenantId};
    use chrono::{TimeZone, Utc};

    fn build_worker() -> (Arc<Worker>, Arc<MemoryStore>, Arc<Queues>, Arc<ManualClock>, TenantId, ProjectId)
    {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let queues = Arc::new(Queues::in_memory(clock.clone(), kv.clone()));
        let vault = Arc::new(CredentialVault::new(
            store.clone(),
            kv.clone(),
            TokenCipher::from_secret("worker-test"),
        ));
        let mut registry = AdapterRegistry::new(vault.clone(), kv.clone());
        registry.register(Box::new(
            MockAdapter::new(ChannelKind::Website).succeed_with("hello-slug"),
        ));
        let publisher = Arc::new(Publisher::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            Arc::new(registry),
            vault,
            queues.publishing.clone(),
            PublisherConfig::default(),
        ));
        let flags = FeatureFlags::new(store.clone(), kv.clone(), Duration::from_secs(30));
        let runtime = Arc::new(AutomationRuntime::new(
            store.clone(),
            kv.clone(),
            clock.clone(),
            RetryingGenerator::new(Arc::new(MockGenerator::new()), 2),
            flags,
            queues.publishing.clone(),
            queues.analytics.clone(),
            AutomationConfig::default(),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            kv,
            "platform:worker:heartbeat",
            Duration::from_secs(45),
        ));
        let worker = Arc::new(Worker::new(
            queues.clone(),
            publisher,
            runtime,
            heartbeat,
            clock.clone(),
            PublisherConfig::default(),
            BeatsConfig::default(),
        ));

        let tenant_id = TenantId::new();
        let project_id = ProjectId::new();
        store
            .insert_tenant(&Tenant {
                id: tenant_id,
                name: "Acme".into(),
                created_at: clock.now(),
            })
            .unwrap();
        store
            .insert_project(&Project {
                id: project_id,
                tenant_id,
                name: "Main".into(),
                created_at: clock.now(),
            })
            .unwrap();

        (worker, store, queues, clock, tenant_id, project_id)
    }

    #[tokio::test]
    async fn test_worker_processes_publish_job_and_stops() {
        let (worker, store, queues, clock, tenant_id, project_id) = build_worker();
        let channel = Channel::new(
            tenant_id,
            project_id,
            ChannelKind::Website,
            "Website",
            ChannelCapabilities::text_only(10_000),
            clock.now(),
        );
        store.insert_channel(&channel).unwrap();
        let post = Post::new(tenant_id, project_id, "Hello", "Body", clock.now())
            .scheduled_at(clock.now());
        store.insert_post(&post).unwrap();
        queues
            .publishing
            .enqueue(Job::Publish {
                tenant_id,
                post_id: post.id,
                attempt: 1,
            })
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        // Wait for the worker to drain the job.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let reloaded = store.post(tenant_id, post.id).unwrap().unwrap();
            if reloaded.status == PostStatus::Published {
                break;
            }
        }
        let reloaded = store.post(tenant_id, post.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PostStatus::Published);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_idle_shutdown_is_prompt() {
        let (worker, _, _, _, _, _) = build_worker();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        // An idle worker exits without waiting for a grace period.
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("worker should stop promptly")
            .unwrap();
    }
}
