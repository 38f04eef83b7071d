//! Clock and deadline primitives.
//!
//! Every time-dependent component takes a `Clock` so that scheduler beats,
//! guardrail windows, and TTL bookkeeping are testable without sleeping.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Stores the offset from a fixed epoch in milliseconds so the clock can be
/// shared across tasks and advanced from any of them.
#[derive(Debug)]
pub struct ManualClock {
    epoch: DateTime<Utc>,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            epoch: start,
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute instant (must not move backwards).
    pub fn set(&self, to: DateTime<Utc>) {
        let offset = (to - self.epoch).num_milliseconds();
        self.offset_ms.store(offset, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.epoch + ChronoDuration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// An absolute cutoff for an operation, derived from a start time + budget.
#[derive(Debug, Clone)]
pub struct Deadline {
    cutoff: DateTime<Utc>,
    budget: Duration,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            cutoff: clock.now() + ChronoDuration::from_std(budget).unwrap_or_default(),
            budget,
        }
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.cutoff
    }

    /// Time left before the cutoff, zero once expired.
    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        (self.cutoff - clock.now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Apply +/- `frac` random jitter to a beat interval so that multiple
/// scheduler instances do not fire in lockstep.
pub fn jitter(base: Duration, frac: f64) -> Duration {
    use rand::Rng;
    let frac = frac.clamp(0.0, 1.0);
    let spread = base.as_secs_f64() * frac;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.05))
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;
