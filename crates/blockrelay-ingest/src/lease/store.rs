//! Coordination stores
//!
//! A coordination store is a tiny versioned key/value table whose only
//! mutations are conditional. Every successful write produces a new version;
//! a write that names a stale version is refused.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped { version: u64 },
    /// The precondition did not hold. `current` is the entry as it is now,
    /// if it could be read.
    Conflict { current: Option<Versioned> },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored version is negative: {0}")]
    InvalidVersion(i64),
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `value` if the entry is absent (`expected == None`) or currently
    /// at `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasOutcome, StoreError>;

    /// Remove the entry if it is at `expected`. Returns whether it was removed.
    async fn delete(&self, key: &str, expected: u64) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Versioned>,
    last_version: u64,
}

/// Store for a single process. Versions come from one counter, so an entry
/// that is deleted and recreated never repeats a version.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    state: Mutex<MemoryState>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock();
        let current = state.entries.get(key).map(|e| e.version);

        if current != expected {
            return Ok(CasOutcome::Conflict {
                current: state.entries.get(key).cloned(),
            });
        }

        state.last_version += 1;
        let version = state.last_version;
        state
            .entries
            .insert(key.to_string(), Versioned { version, value });

        Ok(CasOutcome::Swapped { version })
    }

    async fn delete(&self, key: &str, expected: u64) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if entry.version == expected => {
                state.entries.remove(key);
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Store backed by the `coordination_entries` table. Each operation is one
/// conditional statement.
pub struct PgCoordinationStore {
    pool: PgPool,
}

impl PgCoordinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_version(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::InvalidVersion(raw))
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

#[async_trait]
impl CoordinationStore for PgCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
            "SELECT version, value FROM coordination_entries WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(version, value)| {
            Ok(Versioned {
                version: to_version(version)?,
                value,
            })
        })
        .transpose()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> Result<CasOutcome, StoreError> {
        let written: Option<i64> = match expected {
            None => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO coordination_entries (key, version, value, updated_at)
                    VALUES ($1, 1, $2, NOW())
                    ON CONFLICT (key) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(&value)
                .fetch_optional(&self.pool)
                .await?
            },
            Some(expected) => {
                sqlx::query_scalar(
                    r#"
                    UPDATE coordination_entries
                    SET version = version + 1, value = $3, updated_at = NOW()
                    WHERE key = $1 AND version = $2
                    RETURNING version
                    "#,
                )
                .bind(key)
                .bind(to_db_version(expected))
                .bind(&value)
                .fetch_optional(&self.pool)
                .await?
            },
        };

        match written {
            Some(version) => Ok(CasOutcome::Swapped {
                version: to_version(version)?,
            }),
            None => Ok(CasOutcome::Conflict {
                current: self.get(key).await?,
            }),
        }
    }

    async fn delete(&self, key: &str, expected: u64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM coordination_entries WHERE key = $1 AND version = $2")
            .bind(key)
            .bind(to_db_version(expected))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
