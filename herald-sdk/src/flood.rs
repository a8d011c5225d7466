//! Outbound flood control.
//!
//! Every line the bot writes (raw lines, JOINs, the final QUIT) passes
//! through a [`FloodQueue`]. The queue is bounded and drained by its own task,
//! which takes one token from a [`FloodBucket`] per line and sleeps until the
//! next refill when the bucket is empty. Lines are never dropped or
//! reordered; a full queue is reported to the caller as
//! [`ClientError::Backpressure`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ClientError, Result};

/// Shortest refill interval a bucket will run with.
const MIN_REFILL_INTERVAL: Duration = Duration::from_millis(1);

/// Rate limit applied to outbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodPolicy {
    /// Lines allowed per refill interval.
    pub capacity: usize,
    /// The bucket is refilled to `capacity` once per interval.
    pub refill_interval: Duration,
    /// Maximum number of lines waiting for a token.
    pub queue_capacity: usize,
}

impl Default for FloodPolicy {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_interval: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// Token bucket refilled in full on a fixed schedule.
#[derive(Debug, Clone)]
pub struct FloodBucket {
    capacity: usize,
    refill_interval: Duration,
    available: usize,
    last_refill: Instant,
}

impl FloodBucket {
    /// A full bucket whose refill schedule starts at `now`. A zero capacity
    /// or interval is raised to the smallest usable value.
    pub fn new(policy: &FloodPolicy, now: Instant) -> Self {
        let capacity = policy.capacity.max(1);
        Self {
            capacity,
            refill_interval: policy.refill_interval.max(MIN_REFILL_INTERVAL),
            available: capacity,
            last_refill: now,
        }
    }

    pub fn available(&self) -> usize {
        self.available
    }

    /// Take one token. When the bucket is empty, returns the instant of the
    /// next refill instead.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Instant> {
        self.refill(now);
        if self.available == 0 {
            return Err(self.last_refill + self.refill_interval);
        }
        self.available -= 1;
        Ok(())
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < self.refill_interval {
            return;
        }
        // Keep the schedule anchored: skip whole periods, not to `now`.
        let periods = elapsed.as_nanos() / self.refill_interval.as_nanos();
        let skipped = self.refill_interval.as_nanos().saturating_mul(periods);
        self.last_refill += Duration::from_nanos(u64::try_from(skipped).unwrap_or(u64::MAX));
        self.available = self.capacity;
    }
}

/// An outbound protocol action. Each one costs a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Raw(String),
    Join(String),
    Quit(String),
}

/// Bounded, rate-limited outbound queue.
#[derive(Debug, Clone)]
pub struct FloodQueue {
    tx: mpsc::Sender<Outbound>,
    capacity: usize,
}

impl FloodQueue {
    /// Start the draining task. `deliver` is called once per line, in order,
    /// only after a token was taken for it.
    pub fn spawn<F>(policy: &FloodPolicy, mut deliver: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut(Outbound) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Outbound>(policy.queue_capacity.max(1));
        let mut bucket = FloodBucket::new(policy, Instant::now());

        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                while let Err(next_refill) = bucket.try_take(Instant::now()) {
                    tracing::debug!(
                        wait_ms = next_refill.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Flood limit reached, delaying outbound line"
                    );
                    tokio::time::sleep_until(next_refill).await;
                }
                deliver(item);
            }
        });

        let queue = Self { tx, capacity: policy.queue_capacity.max(1) };
        (queue, task)
    }

    /// Enqueue a line without waiting.
    pub fn push(&self, item: Outbound) -> Result<()> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::Backpressure { capacity: self.capacity },
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed("outbound queue"),
        })
    }
}
