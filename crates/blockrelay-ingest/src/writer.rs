//! Indexer writer
//!
//! Persists normalized events exactly once. Every batch is one transaction
//! and every row insert is conditional on its natural key, so replaying a
//! block after a crash or a retry is harmless.
//!
//! Checkpoints carry the fencing token of the lease they were written under.
//! A checkpoint from an older token than the stored one is refused, so a
//! worker that lost its lease cannot move the stream.

use async_trait::async_trait;
use blockrelay_common::BlockHash;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::normalize::NormalizedEvent;

/// Last height fully handled by a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream_name: String,
    pub height: u64,
    pub block_hash: BlockHash,
    pub fencing_token: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Value out of range for storage: {0}")]
    OutOfRange(String),

    #[error("Stored block hash is invalid: {0}")]
    InvalidHash(#[from] blockrelay_common::RelayError),

    #[error("Writer unavailable: {0}")]
    Unavailable(String),

    #[error("Checkpoint for {stream} refused: fencing token {token} is stale")]
    Fenced { stream: String, token: u64 },
}

#[async_trait]
pub trait IndexerWriter: Send + Sync {
    /// Insert events, skipping any whose natural key already exists.
    /// Returns the number of rows actually inserted.
    async fn write(&self, events: &[NormalizedEvent]) -> Result<u64, WriterError>;

    /// Move the stream checkpoint forward. A lower height never overwrites a
    /// higher one; a token lower than the stored one fails with `Fenced`.
    async fn save_checkpoint(
        &self,
        stream_name: &str,
        height: u64,
        block_hash: &BlockHash,
        fencing_token: u64,
    ) -> Result<(), WriterError>;

    async fn load_checkpoint(&self, stream_name: &str) -> Result<Option<Checkpoint>, WriterError>;
}

fn to_i64(value: u64) -> Result<i64, WriterError> {
    i64::try_from(value).map_err(|_| WriterError::OutOfRange(value.to_string()))
}

fn to_i32(value: u32) -> Result<i32, WriterError> {
    i32::try_from(value).map_err(|_| WriterError::OutOfRange(value.to_string()))
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PgWriter {
    pool: PgPool,
}

impl PgWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    stream_name: String,
    height: i64,
    block_hash: String,
    fencing_token: i64,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl IndexerWriter for PgWriter {
    #[instrument(skip(self, events), fields(events = events.len()))]
    async fn write(&self, events: &[NormalizedEvent]) -> Result<u64, WriterError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for event in events {
            let result = sqlx::query(
                r#"
                INSERT INTO indexed_events (
                    block_height, shard_id, event_index,
                    block_hash, event_type, data
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (block_height, shard_id, event_index) DO NOTHING
                "#,
            )
            .bind(to_i64(event.block_height)?)
            .bind(to_i32(event.shard_id)?)
            .bind(to_i32(event.event_index)?)
            .bind(event.block_hash.to_string())
            .bind(&event.event_type)
            .bind(&event.data)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;

        debug!(inserted, skipped = events.len() as u64 - inserted, "Wrote events");
        Ok(inserted)
    }

    async fn save_checkpoint(
        &self,
        stream_name: &str,
        height: u64,
        block_hash: &BlockHash,
        fencing_token: u64,
    ) -> Result<(), WriterError> {
        // No row comes back only when the stored token is newer.
        let accepted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO stream_checkpoints (stream_name, height, block_hash, fencing_token, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (stream_name) DO UPDATE
            SET height = GREATEST(stream_checkpoints.height, EXCLUDED.height),
                block_hash = CASE
                    WHEN EXCLUDED.height > stream_checkpoints.height THEN EXCLUDED.block_hash
                    ELSE stream_checkpoints.block_hash
                END,
                fencing_token = EXCLUDED.fencing_token,
                updated_at = EXCLUDED.updated_at
            WHERE stream_checkpoints.fencing_token <= EXCLUDED.fencing_token
            RETURNING height
            "#,
        )
        .bind(stream_name)
        .bind(to_i64(height)?)
        .bind(block_hash.to_string())
        .bind(to_i64(fencing_token)?)
        .fetch_optional(&self.pool)
        .await?;

        match accepted {
            Some(_) => Ok(()),
            None => Err(WriterError::Fenced {
                stream: stream_name.to_string(),
                token: fencing_token,
            }),
        }
    }

    async fn load_checkpoint(&self, stream_name: &str) -> Result<Option<Checkpoint>, WriterError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT stream_name, height, block_hash, fencing_token, updated_at
            FROM stream_checkpoints
            WHERE stream_name = $1
            "#,
        )
        .bind(stream_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Checkpoint {
                stream_name: row.stream_name,
                height: u64::try_from(row.height)
                    .map_err(|_| WriterError::OutOfRange(row.height.to_string()))?,
                block_hash: row.block_hash.parse()?,
                fencing_token: u64::try_from(row.fencing_token)
                    .map_err(|_| WriterError::OutOfRange(row.fencing_token.to_string()))?,
                updated_at: row.updated_at,
            })
        })
        .transpose()
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Writer for tests and dry runs. Can be told to fail a number of upcoming
/// writes.
#[derive(Default)]
pub struct MemoryWriter {
    events: Mutex<BTreeMap<(u64, u32, u32), NormalizedEvent>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    failures_left: AtomicU32,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `write` fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<NormalizedEvent> {
        self.events.lock().values().cloned().collect()
    }

    pub fn heights(&self) -> Vec<u64> {
        let mut heights: Vec<u64> = self.events.lock().keys().map(|k| k.0).collect();
        heights.dedup();
        heights
    }
}

#[async_trait]
impl IndexerWriter for MemoryWriter {
    async fn write(&self, events: &[NormalizedEvent]) -> Result<u64, WriterError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(WriterError::Unavailable("injected failure".to_string()));
        }

        let mut stored = self.events.lock();
        let mut inserted = 0;
        for event in events {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                stored.entry(event.natural_key())
            {
                slot.insert(event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn save_checkpoint(
        &self,
        stream_name: &str,
        height: u64,
        block_hash: &BlockHash,
        fencing_token: u64,
    ) -> Result<(), WriterError> {
        let mut checkpoints = self.checkpoints.lock();
        let checkpoint = match checkpoints.get(stream_name) {
            Some(current) if current.fencing_token > fencing_token => {
                return Err(WriterError::Fenced {
                    stream: stream_name.to_string(),
                    token: fencing_token,
                });
            },
            Some(current) if current.height >= height => Checkpoint {
                fencing_token,
                updated_at: Utc::now(),
                ..current.clone()
            },
            _ => Checkpoint {
                stream_name: stream_name.to_string(),
                height,
                block_hash: *block_hash,
                fencing_token,
                updated_at: Utc::now(),
            },
        };
        checkpoints.insert(stream_name.to_string(), checkpoint);
        Ok(())
    }

    async fn load_checkpoint(&self, stream_name: &str) -> Result<Option<Checkpoint>, WriterError> {
        Ok(self.checkpoints.lock().get(stream_name).cloned())
    }
}
