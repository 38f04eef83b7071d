//! Work queues — `publishing`, `scheduler`, and `analytics`.
//!
//! Jobs carry the tenant id and a payload; delayed entries become visible
//! once their ready time passes. Queue depths are mirrored into KV so the
//! health subsystem can read backlog sizes without touching the queues.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::QueueError;
use crate::kv::{Kv, keys};
use crate::types::{PostId, RunId, TenantId};

pub const QUEUE_PUBLISHING: &str = "publishing";
pub const QUEUE_SCHEDULER: &str = "scheduler";
pub const QUEUE_ANALYTICS: &str = "analytics";

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Publish {
        tenant_id: TenantId,
        post_id: PostId,
        attempt: u32,
    },
    Automation {
        tenant_id: TenantId,
        run_id: RunId,
    },
    MetricsSync {
        tenant_id: TenantId,
    },
}

impl Job {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Job::Publish { tenant_id, .. }
            | Job::Automation { tenant_id, .. }
            | Job::MetricsSync { tenant_id } => *tenant_id,
        }
    }
}

/// FIFO queue with delayed visibility.
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;
    fn enqueue(&self, job: Job) -> Result<(), QueueError>;
    fn enqueue_after(&self, job: Job, delay: Duration) -> Result<(), QueueError>;
    /// Next job whose ready time has passed, if any.
    fn pop_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;
    fn depth(&self) -> u64;
}

struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(DateTime<Utc>, Job)>,
}

/// In-process queue backed by a mutex-guarded deque.
pub struct MemoryQueue {
    name: String,
    clock: SharedClock,
    kv: Arc<dyn Kv>,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, clock: SharedClock, kv: Arc<dyn Kv>) -> Self {
        Self {
            name: name.into(),
            clock,
            kv,
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                delayed: Vec::new(),
            }),
        }
    }

    fn mirror_depth(&self, state: &QueueState) {
        let depth = (state.ready.len() + state.delayed.len()) as u64;
        // Depth mirroring is best-effort; health reads tolerate staleness.
        let _ = self
            .kv
            .set(&keys::queue_depth(&self.name), &depth.to_string());
    }

    fn promote_due(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let mut index = 0;
        while index < state.delayed.len() {
            if state.delayed[index].0 <= now {
                let (_, job) = state.delayed.remove(index);
                state.ready.push_back(job);
            } else {
                index += 1;
            }
        }
    }
}

impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.ready.push_back(job);
        self.mirror_depth(&state);
        Ok(())
    }

    fn enqueue_after(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        let ready_at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.delayed.push((ready_at, job));
        self.mirror_depth(&state);
        Ok(())
    }

    fn pop_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock().unwrap();
        self.promote_due(&mut state, now);
        let job = state.ready.pop_front();
        self.mirror_depth(&state);
        Ok(job)
    }

    fn depth(&self) -> u64 {
        let state = self.state.lock().unwrap();
        (state.ready.len() + state.delayed.len()) as u64
    }
}

/// The three logical queues wired together.
pub struct Queues {
    pub publishing: Arc<dyn JobQueue>,
    pub scheduler: Arc<dyn JobQueue>,
    pub analytics: Arc<dyn JobQueue>,
}

impl Queues {
    pub fn in_memory(clock: SharedClock, kv: Arc<dyn Kv>) -> Self {
        Self {
            publishing: Arc::new(MemoryQueue::new(QUEUE_PUBLISHING, clock.clone(), kv.clone())),
            scheduler: Arc::new(MemoryQueue::new(QUEUE_SCHEDULER, clock.clone(), kv.clone())),
            analytics: Arc::new(MemoryQueue::new(QUEUE_ANALYTICS, clock, kv)),
        }
    }

    pub fn total_backlog(&self) -> u64 {
        self.publishing.depth() + self.scheduler.depth() + self.analytics.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::kv::MemoryKv;
    use chrono::TimeZone;

    fn queue() -> (MemoryQueue, Arc<ManualClock>, Arc<MemoryKv>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        (
            MemoryQueue::new(QUEUE_PUBLISHING, clock.clone(), kv.clone()),
            clock,
            kv,
        )
    }

    fn publish_job() -> Job {
        Job::Publish {
            tenant_id: TenantId::new(),
            post_id: PostId::new(),
            attempt: 1,
        }
    }

    #[test]
    fn test_fifo_order() {
        let (queue, clock, _) = queue();
        let first = publish_job();
        let second = publish_job();
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        assert_eq!(queue.pop_ready(clock.now()).unwrap(), Some(first));
        assert_eq!(queue.pop_ready(clock.now()).unwrap(), Some(second));
        assert_eq!(queue.pop_ready(clock.now()).unwrap(), None);
    }

    #[test]
    fn test_delayed_jobs_become_visible() {
        let (queue, clock, _) = queue();
        let job = publish_job();
        queue
            .enqueue_after(job.clone(), Duration::from_secs(60))
            .unwrap();

        assert_eq!(queue.pop_ready(clock.now()).unwrap(), None);
        assert_eq!(queue.depth(), 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(queue.pop_ready(clock.now()).unwrap(), Some(job));
    }

    #[test]
    fn test_depth_mirrored_to_kv() {
        let (queue, clock, kv) = queue();
        queue.enqueue(publish_job()).unwrap();
        queue.enqueue(publish_job()).unwrap();
        assert_eq!(
            kv.get(&keys::queue_depth(QUEUE_PUBLISHING)).unwrap().as_deref(),
            Some("2")
        );
        queue.pop_ready(clock.now()).unwrap();
        assert_eq!(
            kv.get(&keys::queue_depth(QUEUE_PUBLISHING)).unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let job = Job::Automation {
            tenant_id: TenantId::new(),
            run_id: RunId::new(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"kind\":\"automation\""));
        let restored: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, job);
    }
}
