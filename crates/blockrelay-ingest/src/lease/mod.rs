//! Lease-based stream coordination
//!
//! Only the holder of a stream's lease may advance that stream. A lease is a
//! record in a [`CoordinationStore`] naming the holder and an expiry time:
//!
//! 1. Acquisition creates the record if it is absent, or takes over an
//!    expired record by CAS on the version that was read.
//! 2. The holder renews before `expires_at`, again by CAS on the version it
//!    last wrote. If anyone else wrote in between, the renewal fails and the
//!    lease is gone.
//! 3. Release writes an already-expired record by CAS, so it can never undo
//!    a newer holder's acquisition.
//!
//! Every takeover bumps a fencing token carried in the record. Writers that
//! persist stream state pass it along so a stale holder's writes are refused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::queue::DeliveryGate;

pub mod store;

pub use store::{CasOutcome, CoordinationStore, MemoryCoordinationStore, PgCoordinationStore, StoreError, Versioned};

const LEASE_KEY_PREFIX: &str = "lease/";

/// What is stored under a lease key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    holder_id: String,
    expires_at: DateTime<Utc>,
    acquired_at: DateTime<Utc>,
    #[serde(default)]
    fencing_token: u64,
}

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub stream_name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Increases on every change of holder.
    pub fencing_token: u64,
    pub ttl: Duration,
    version: u64,
}

impl Lease {
    /// Store version this lease was last written at
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("stream {stream} is held by {holder} until {expires_at}")]
    Denied {
        stream: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lease on stream {stream} expired or was taken over")]
    Expired { stream: String },

    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("unreadable lease record for stream {stream}: {reason}")]
    Codec { stream: String, reason: String },
}

pub struct LeaseCoordinator {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn key(stream: &str) -> String {
        format!("{LEASE_KEY_PREFIX}{stream}")
    }

    fn encode(stream: &str, record: &LeaseRecord) -> Result<Vec<u8>, LeaseError> {
        serde_json::to_vec(record).map_err(|e| LeaseError::Codec {
            stream: stream.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(stream: &str, raw: &[u8]) -> Result<LeaseRecord, LeaseError> {
        serde_json::from_slice(raw).map_err(|e| LeaseError::Codec {
            stream: stream.to_string(),
            reason: e.to_string(),
        })
    }

    fn denied(stream: &str, current: Option<&Versioned>) -> LeaseError {
        let record = current.and_then(|c| Self::decode(stream, &c.value).ok());
        LeaseError::Denied {
            stream: stream.to_string(),
            holder: record
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |r| r.holder_id.clone()),
            expires_at: record.map_or(DateTime::<Utc>::MIN_UTC, |r| r.expires_at),
        }
    }

    /// Try once to take the lease on `stream`. `Denied` is a normal outcome
    /// while another holder's lease is live.
    pub async fn acquire(&self, stream: &str, holder_id: &str, ttl: Duration) -> Result<Lease, LeaseError> {
        let key = Self::key(stream);
        let now = self.clock.now();

        let (expected, fencing_token) = match self.store.get(&key).await? {
            None => (None, 1),
            Some(current) => {
                let record = Self::decode(stream, &current.value)?;
                if now < record.expires_at {
                    return Err(LeaseError::Denied {
                        stream: stream.to_string(),
                        holder: record.holder_id,
                        expires_at: record.expires_at,
                    });
                }
                debug!(stream, previous = %record.holder_id, "Taking over expired lease");
                (Some(current.version), record.fencing_token.saturating_add(1))
            },
        };

        let record = LeaseRecord {
            holder_id: holder_id.to_string(),
            expires_at: now + clock::to_chrono(ttl),
            acquired_at: now,
            fencing_token,
        };

        match self
            .store
            .compare_and_swap(&key, expected, Self::encode(stream, &record)?)
            .await?
        {
            CasOutcome::Swapped { version } => {
                info!(stream, holder = holder_id, fencing_token, "Acquired lease");
                Ok(Lease {
                    stream_name: stream.to_string(),
                    holder_id: holder_id.to_string(),
                    acquired_at: record.acquired_at,
                    expires_at: record.expires_at,
                    fencing_token,
                    ttl,
                    version,
                })
            },
            CasOutcome::Conflict { current } => Err(Self::denied(stream, current.as_ref())),
        }
    }

    /// Extend a live lease by its TTL from now.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        let now = self.clock.now();
        if lease.is_expired_at(now) {
            return Err(LeaseError::Expired {
                stream: lease.stream_name.clone(),
            });
        }

        let record = LeaseRecord {
            holder_id: lease.holder_id.clone(),
            expires_at: now + clock::to_chrono(lease.ttl),
            acquired_at: lease.acquired_at,
            fencing_token: lease.fencing_token,
        };

        match self
            .store
            .compare_and_swap(
                &Self::key(&lease.stream_name),
                Some(lease.version),
                Self::encode(&lease.stream_name, &record)?,
            )
            .await?
        {
            CasOutcome::Swapped { version } => {
                debug!(stream = %lease.stream_name, expires_at = %record.expires_at, "Renewed lease");
                Ok(Lease {
                    expires_at: record.expires_at,
                    version,
                    ..lease.clone()
                })
            },
            CasOutcome::Conflict { .. } => Err(LeaseError::Expired {
                stream: lease.stream_name.clone(),
            }),
        }
    }

    /// Give the lease up. Returns `false` when it had already been taken over,
    /// in which case nothing is written.
    pub async fn release(&self, lease: Lease) -> Result<bool, LeaseError> {
        let now = self.clock.now();
        let record = LeaseRecord {
            holder_id: lease.holder_id.clone(),
            expires_at: now,
            acquired_at: lease.acquired_at,
            fencing_token: lease.fencing_token,
        };

        match self
            .store
            .compare_and_swap(
                &Self::key(&lease.stream_name),
                Some(lease.version),
                Self::encode(&lease.stream_name, &record)?,
            )
            .await?
        {
            CasOutcome::Swapped { .. } => {
                info!(stream = %lease.stream_name, holder = %lease.holder_id, "Released lease");
                Ok(true)
            },
            CasOutcome::Conflict { .. } => {
                debug!(stream = %lease.stream_name, "Lease already taken over, nothing to release");
                Ok(false)
            },
        }
    }

    /// Current live holder of `stream`, if any.
    pub async fn holder(&self, stream: &str) -> Result<Option<(String, DateTime<Utc>)>, LeaseError> {
        let now = self.clock.now();
        match self.store.get(&Self::key(stream)).await? {
            Some(current) => {
                let record = Self::decode(stream, &current.value)?;
                Ok((now < record.expires_at).then_some((record.holder_id, record.expires_at)))
            },
            None => Ok(None),
        }
    }
}

// ============================================================================
// Keeper
// ============================================================================

/// Background renewal for a held lease.
///
/// Renews every `ttl / 3`. When a renewal is refused, or the lease runs out
/// while the store is unreachable, the loss is published on [`Self::lost`]
/// and the task ends.
pub struct LeaseKeeper {
    coordinator: Arc<LeaseCoordinator>,
    current: watch::Receiver<Lease>,
    lost_tx: Arc<watch::Sender<bool>>,
    lost: watch::Receiver<bool>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    pub fn spawn(coordinator: Arc<LeaseCoordinator>, lease: Lease) -> Self {
        let (lease_tx, lease_rx) = watch::channel(lease.clone());
        let (lost_tx, lost_rx) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let period = (lease.ttl / 3).max(Duration::from_millis(10));
        let renewer = coordinator.clone();
        let signal = lost_tx.clone();

        let handle = tokio::spawn(async move {
            let mut lease = lease;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => {}
                }

                match renewer.renew(&lease).await {
                    Ok(renewed) => {
                        lease = renewed;
                        lease_tx.send_replace(lease.clone());
                    },
                    Err(LeaseError::Expired { stream }) => {
                        warn!(stream = %stream, "Lease lost");
                        signal.send_replace(true);
                        return;
                    },
                    Err(e) => {
                        if lease.is_expired_at(renewer.clock().now()) {
                            warn!(stream = %lease.stream_name, error = %e, "Lease ran out while renewal kept failing");
                            signal.send_replace(true);
                            return;
                        }
                        warn!(stream = %lease.stream_name, error = %e, "Lease renewal failed, will retry");
                    },
                }
            }
        });

        Self {
            coordinator,
            current: lease_rx,
            lost_tx,
            lost: lost_rx,
            stop: Some(stop_tx),
            handle,
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Receiver that flips to `true` once the lease is lost or released.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    /// The most recently renewed lease.
    pub fn lease(&self) -> Lease {
        self.current.borrow().clone()
    }

    /// Handle for code that may only write while this lease is held.
    pub fn fence(&self) -> LeaseFence {
        LeaseFence {
            current: self.current.clone(),
            lost: self.lost.clone(),
            clock: self.coordinator.clock().clone(),
        }
    }

    /// Stop renewing and release the lease unless it was already lost.
    /// Every fence handed out is closed first.
    pub async fn release(mut self) -> Result<bool, LeaseError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "Lease keeper task ended abnormally");
        }

        let was_lost = self.lost_tx.send_replace(true);
        if was_lost {
            return Ok(false);
        }
        self.coordinator.release(self.lease()).await
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Fence
// ============================================================================

/// Read-only view of a kept lease.
///
/// Open while the keeper has not reported a loss and the lease has not run
/// out on the local clock. The second condition matters when the store is
/// unreachable: the keeper only notices on its next tick, but another worker
/// may take over the moment `expires_at` passes.
#[derive(Clone)]
pub struct LeaseFence {
    current: watch::Receiver<Lease>,
    lost: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
}

impl LeaseFence {
    /// Fencing token of the live lease.
    pub fn check(&self) -> Result<u64, LeaseError> {
        let lease = self.current.borrow();
        if *self.lost.borrow() || lease.is_expired_at(self.clock.now()) {
            return Err(LeaseError::Expired {
                stream: lease.stream_name.clone(),
            });
        }
        Ok(lease.fencing_token)
    }
}

impl DeliveryGate for LeaseFence {
    fn is_open(&self) -> bool {
        self.check().is_ok()
    }
}
