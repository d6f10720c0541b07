//! Dead-letter tracking
//!
//! Failures that will not be retried automatically are accumulated here for
//! offline inspection. Every write is a single insert-or-increment, never a
//! read followed by a write, so concurrent failures for the same key cannot
//! lose updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// Identity of a failing thing: what failed, how, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadLetterKey {
    pub resource_id: String,
    pub error_type: String,
    pub sub_key: String,
}

impl DeadLetterKey {
    pub fn new(
        resource_id: impl Into<String>,
        error_type: impl Into<String>,
        sub_key: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            error_type: error_type.into(),
            sub_key: sub_key.into(),
        }
    }

    /// Key for a block height that failed in `stage`.
    pub fn for_height(height: u64, error_type: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::new(height.to_string(), error_type, stage)
    }
}

impl fmt::Display for DeadLetterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_id, self.error_type, self.sub_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub key: DeadLetterKey,
    pub attempts: u32,
    pub last_error: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait DeadLetterTracker: Send + Sync {
    /// Insert the record with one attempt, or increment an existing one.
    /// Returns the attempt count after this failure.
    async fn record_failure(&self, key: &DeadLetterKey, error: &str) -> Result<u32, DeadLetterError>;

    async fn get(&self, key: &DeadLetterKey) -> Result<Option<DeadLetterRecord>, DeadLetterError>;

    /// Records with at least `min_attempts` attempts, most attempted first.
    async fn list(&self, min_attempts: u32) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Single-process tracker. Each key's entry is updated under its shard lock.
pub struct MemoryDeadLetterTracker {
    records: DashMap<DeadLetterKey, DeadLetterRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryDeadLetterTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryDeadLetterTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterTracker for MemoryDeadLetterTracker {
    async fn record_failure(&self, key: &DeadLetterKey, error: &str) -> Result<u32, DeadLetterError> {
        let now = self.clock.now();
        let mut entry = self
            .records
            .entry(key.clone())
            .and_modify(|record| {
                record.attempts = record.attempts.saturating_add(1);
                record.last_error = error.to_string();
                record.last_seen_at = now;
            })
            .or_insert_with(|| DeadLetterRecord {
                key: key.clone(),
                attempts: 1,
                last_error: error.to_string(),
                first_seen_at: now,
                last_seen_at: now,
            });

        let attempts = entry.value_mut().attempts;
        debug!(key = %key, attempts, "Recorded failure");
        Ok(attempts)
    }

    async fn get(&self, key: &DeadLetterKey) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn list(&self, min_attempts: u32) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut records: Vec<DeadLetterRecord> = self
            .records
            .iter()
            .filter(|r| r.attempts >= min_attempts)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.attempts
                .cmp(&a.attempts)
                .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
        });
        Ok(records)
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    resource_id: String,
    error_type: String,
    sub_key: String,
    attempts: i32,
    last_error: String,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for DeadLetterRecord {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            key: DeadLetterKey::new(row.resource_id, row.error_type, row.sub_key),
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

/// Tracker backed by the `dead_letters` table
pub struct PgDeadLetterTracker {
    pool: PgPool,
}

impl PgDeadLetterTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterTracker for PgDeadLetterTracker {
    async fn record_failure(&self, key: &DeadLetterKey, error: &str) -> Result<u32, DeadLetterError> {
        let attempts: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO dead_letters (
                resource_id, error_type, sub_key, attempts,
                last_error, first_seen_at, last_seen_at
            )
            VALUES ($1, $2, $3, 1, $4, NOW(), NOW())
            ON CONFLICT (resource_id, error_type, sub_key) DO UPDATE
            SET attempts = dead_letters.attempts + 1,
                last_error = EXCLUDED.last_error,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING attempts
            "#,
        )
        .bind(&key.resource_id)
        .bind(&key.error_type)
        .bind(&key.sub_key)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        let attempts = u32::try_from(attempts).unwrap_or(0);
        if attempts > 1 {
            warn!(key = %key, attempts, "Repeated failure");
        } else {
            debug!(key = %key, "Recorded failure");
        }
        Ok(attempts)
    }

    async fn get(&self, key: &DeadLetterKey) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT resource_id, error_type, sub_key, attempts,
                   last_error, first_seen_at, last_seen_at
            FROM dead_letters
            WHERE resource_id = $1 AND error_type = $2 AND sub_key = $3
            "#,
        )
        .bind(&key.resource_id)
        .bind(&key.error_type)
        .bind(&key.sub_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list(&self, min_attempts: u32) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let min_attempts = i32::try_from(min_attempts).unwrap_or(i32::MAX);
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT resource_id, error_type, sub_key, attempts,
                   last_error, first_seen_at, last_seen_at
            FROM dead_letters
            WHERE attempts >= $1
            ORDER BY attempts DESC, last_seen_at DESC
            "#,
        )
        .bind(min_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_twice_increments() {
        let tracker = MemoryDeadLetterTracker::new();
        let key = DeadLetterKey::new("contract.near", "wasm_parse", "v1");

        assert_eq!(tracker.record_failure(&key, "first").await.unwrap(), 1);
        assert_eq!(tracker.record_failure(&key, "second").await.unwrap(), 2);

        assert_eq!(tracker.len(), 1);
        let record = tracker.get(&key).await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error, "second");
    }

    #[tokio::test]
    async fn test_timestamps() {
        let clock = Arc::new(ManualClock::default());
        let tracker = MemoryDeadLetterTracker::with_clock(clock.clone());
        let key = DeadLetterKey::for_height(7, "before_genesis", "fetch");

        tracker.record_failure(&key, "boom").await.unwrap();
        clock.advance(Duration::from_secs(60));
        tracker.record_failure(&key, "boom").await.unwrap();

        let record = tracker.get(&key).await.unwrap().unwrap();
        assert_eq!(
            record.last_seen_at - record.first_seen_at,
            chrono::Duration::seconds(60)
        );
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let tracker = Arc::new(MemoryDeadLetterTracker::new());
        let key = DeadLetterKey::new("100", "delivery", "object-store");

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let tracker = tracker.clone();
                let key = key.clone();
                tokio::spawn(async move { tracker.record_failure(&key, "err").await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=50).collect::<Vec<u32>>());
        assert_eq!(tracker.get(&key).await.unwrap().unwrap().attempts, 50);
    }

    #[tokio::test]
    async fn test_list_filters_by_attempts() {
        let tracker = MemoryDeadLetterTracker::new();
        let hot = DeadLetterKey::new("a", "t", "s");
        let cold = DeadLetterKey::new("b", "t", "s");

        for _ in 0..5 {
            tracker.record_failure(&hot, "e").await.unwrap();
        }
        tracker.record_failure(&cold, "e").await.unwrap();

        let listed = tracker.list(5).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, hot);

        assert_eq!(tracker.list(0).await.unwrap().len(), 2);
    }
}
