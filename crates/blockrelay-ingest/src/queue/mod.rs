//! Retry/upload queue
//!
//! Holds blocks that still have to reach a [`DurableSink`]. Tasks are kept in
//! due-time order; the drain loop delivers every task whose `next_retry` has
//! passed, with at most `parallelism` deliveries in flight. A failed delivery
//! is rescheduled with exponential backoff until its attempts exceed the
//! policy ceiling, at which point it is recorded in the dead-letter tracker.
//!
//! A gated queue delivers only while an open [`DeliveryGate`] is attached.
//! The gate is checked before every pass and again before every delivery;
//! tasks found behind a closed gate stay queued untouched.
//!
//! ```text
//! enqueue ──► scheduled (by next_retry) ──► in flight ──┬─► delivered
//!                  ▲                                    │
//!                  └──────── backoff ◄── failed ────────┴─► dead letter
//! ```

use blockrelay_common::Block;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::{self, Clock};
use crate::dead_letter::{DeadLetterKey, DeadLetterTracker};
use crate::metrics;

pub mod sink;

pub use sink::{DurableSink, IndexSink, SinkError};

/// Error type recorded for tasks that ran out of attempts.
pub const DELIVERY_EXHAUSTED: &str = "delivery_exhausted";

/// How long the drain loop sleeps with nothing scheduled. Enqueues wake it
/// earlier.
const IDLE_WAIT: Duration = Duration::from_secs(60);

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff: `min(initial * multiplier^(attempts - 1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Failed attempts tolerated before a task is dead-lettered.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next try after `attempts` failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Permission for a queue to deliver right now
pub trait DeliveryGate: Send + Sync {
    fn is_open(&self) -> bool;
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub block: Arc<Block>,
    pub height: u64,
    /// Failed deliveries so far.
    pub attempts: u32,
    pub next_retry: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl UploadTask {
    /// A fresh task, due immediately.
    pub fn new(block: Arc<Block>, now: DateTime<Utc>) -> Self {
        Self {
            height: block.height,
            block,
            attempts: 0,
            next_retry: now,
            last_error: None,
        }
    }
}

/// What happened to one task during a drain pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { height: u64, attempts: u32 },
    Retrying { height: u64, attempts: u32, next_retry: DateTime<Utc> },
    DeadLettered { height: u64, attempts: u32 },
    /// The gate closed before delivery started; nothing was attempted.
    Held { height: u64 },
    /// Out of attempts, but the dead-letter record could not be written.
    /// The task stays queued and is retried after the cap delay.
    Deferred { height: u64, attempts: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {queue} is closed, height {height} not accepted")]
    Closed { queue: String, height: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Scheduled plus in flight.
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct QueueState {
    scheduled: BTreeMap<(DateTime<Utc>, u64), UploadTask>,
    /// Every height that is scheduled or in flight.
    heights: BTreeSet<u64>,
    in_flight: usize,
}

// ============================================================================
// Queue
// ============================================================================

pub struct UploadQueue {
    sink: Arc<dyn DurableSink>,
    dead_letters: Arc<dyn DeadLetterTracker>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    gated: bool,
    gate: Mutex<Option<Arc<dyn DeliveryGate>>>,
    wake: Notify,
    permits: Semaphore,
    closed: AtomicBool,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl UploadQueue {
    pub fn new(
        sink: Arc<dyn DurableSink>,
        dead_letters: Arc<dyn DeadLetterTracker>,
        policy: BackoffPolicy,
        parallelism: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            dead_letters,
            policy,
            clock,
            state: Mutex::new(QueueState::default()),
            gated: false,
            gate: Mutex::new(None),
            wake: Notify::new(),
            permits: Semaphore::new(parallelism.max(1)),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Deliver only while an open gate is attached.
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn attach_gate(&self, gate: Arc<dyn DeliveryGate>) {
        *self.gate.lock() = Some(gate);
        self.wake.notify_one();
    }

    pub fn detach_gate(&self) {
        *self.gate.lock() = None;
    }

    pub fn is_open(&self) -> bool {
        match self.gate.lock().as_ref() {
            Some(gate) => gate.is_open(),
            None => !self.gated,
        }
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Queue a task without waiting. Returns `Ok(false)` when the height is
    /// already pending.
    pub fn enqueue(&self, task: UploadTask) -> Result<bool, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed {
                queue: self.name().to_string(),
                height: task.height,
            });
        }

        {
            let mut state = self.state.lock();
            if !state.heights.insert(task.height) {
                debug!(queue = %self.name(), height = task.height, "Height already queued, ignoring");
                return Ok(false);
            }
            state.scheduled.insert((task.next_retry, task.height), task);
        }

        self.wake.notify_one();
        Ok(true)
    }

    /// Queue a block for immediate delivery.
    pub fn enqueue_block(&self, block: Arc<Block>) -> Result<bool, QueueError> {
        self.enqueue(UploadTask::new(block, self.clock.now()))
    }

    pub fn contains(&self, height: u64) -> bool {
        self.state.lock().heights.contains(&height)
    }

    /// Lowest height still waiting for delivery, including in-flight ones.
    pub fn lowest_pending(&self) -> Option<u64> {
        self.state.lock().heights.first().copied()
    }

    /// Earliest `next_retry` among scheduled tasks.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state.lock().scheduled.keys().next().map(|(due, _)| *due)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending: state.heights.len(),
            in_flight: state.in_flight,
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Deliver every task that is due now, earliest first, and wait for all
    /// of them to settle.
    pub async fn process_due(&self) -> Vec<DeliveryOutcome> {
        if !self.is_open() {
            debug!(queue = %self.name(), "Gate closed, not delivering");
            return Vec::new();
        }

        let now = self.clock.now();
        let due: Vec<UploadTask> = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            while let Some(entry) = state.scheduled.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove());
            }
            state.in_flight += due.len();
            due
        };

        if due.is_empty() {
            return Vec::new();
        }

        futures::future::join_all(due.into_iter().map(|task| self.deliver(task))).await
    }

    async fn deliver(&self, mut task: UploadTask) -> DeliveryOutcome {
        // The semaphore is never closed; a closed one would only lift the limit.
        let _permit = self.permits.acquire().await.ok();
        let height = task.height;

        if !self.is_open() {
            self.reschedule(task);
            return DeliveryOutcome::Held { height };
        }

        let err = match self.sink.put(&task.block).await {
            Ok(()) => {
                self.finish(height);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                metrics::record_delivery(self.name(), "delivered");
                info!(queue = %self.name(), height, attempts = task.attempts, "Delivered block");
                return DeliveryOutcome::Delivered {
                    height,
                    attempts: task.attempts,
                };
            },
            Err(e) => e.to_string(),
        };

        task.attempts = task.attempts.saturating_add(1);
        task.last_error = Some(err.clone());

        if !self.policy.is_exhausted(task.attempts) {
            let delay = self.policy.delay(task.attempts);
            task.next_retry = self.clock.now() + clock::to_chrono(delay);
            self.retried.fetch_add(1, Ordering::Relaxed);
            metrics::record_delivery(self.name(), "retried");
            warn!(
                queue = %self.name(),
                height,
                attempts = task.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery failed, scheduling retry"
            );
            let outcome = DeliveryOutcome::Retrying {
                height,
                attempts: task.attempts,
                next_retry: task.next_retry,
            };
            self.reschedule(task);
            return outcome;
        }

        let key = DeadLetterKey::for_height(height, DELIVERY_EXHAUSTED, self.name());
        match self.dead_letters.record_failure(&key, &err).await {
            Ok(_) => {
                self.finish(height);
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                metrics::record_delivery(self.name(), "dead_lettered");
                metrics::record_dead_letter(DELIVERY_EXHAUSTED);
                error!(
                    queue = %self.name(),
                    height,
                    attempts = task.attempts,
                    error = %err,
                    "Delivery attempts exhausted, dead-lettered"
                );
                DeliveryOutcome::DeadLettered {
                    height,
                    attempts: task.attempts,
                }
            },
            Err(dl_err) => {
                task.next_retry = self.clock.now() + clock::to_chrono(self.policy.cap);
                error!(
                    queue = %self.name(),
                    height,
                    error = %dl_err,
                    "Could not record dead letter, keeping task queued"
                );
                let outcome = DeliveryOutcome::Deferred {
                    height,
                    attempts: task.attempts,
                };
                self.reschedule(task);
                outcome
            },
        }
    }

    fn finish(&self, height: u64) {
        let mut state = self.state.lock();
        state.heights.remove(&height);
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    fn reschedule(&self, task: UploadTask) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.scheduled.insert((task.next_retry, task.height), task);
        }
        self.wake.notify_one();
    }

    /// Drain loop. Runs until `shutdown` flips to true or its sender is
    /// dropped; afterwards the queue refuses new tasks.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.name(), "Retry queue started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.process_due().await;

            // Attaching a gate wakes the loop, so a closed one can wait idle.
            let wait = match self.next_due() {
                Some(due) if self.is_open() => clock::until(self.clock.now(), due),
                _ => IDLE_WAIT,
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.closed.store(true, Ordering::Release);

        let stats = self.stats();
        if stats.pending > 0 {
            warn!(queue = %self.name(), pending = stats.pending, "Retry queue stopped with undelivered tasks");
        } else {
            info!(queue = %self.name(), delivered = stats.delivered, "Retry queue stopped");
        }
    }
}
