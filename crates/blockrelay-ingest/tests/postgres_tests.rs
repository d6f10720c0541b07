//! PostgreSQL-backed store tests
//!
//! Skipped unless DATABASE_URL points at a scratch database. The reference
//! schema is applied once per run; every test uses unique keys so they can
//! share one database.

use blockrelay_common::{Block, BlockHash};
use blockrelay_ingest::clock::SystemClock;
use blockrelay_ingest::dead_letter::{DeadLetterKey, DeadLetterTracker, PgDeadLetterTracker};
use blockrelay_ingest::lease::{
    CasOutcome, CoordinationStore, LeaseCoordinator, LeaseError, PgCoordinationStore,
};
use blockrelay_ingest::normalize::{BlockNormalizer, StreamerMessageNormalizer};
use blockrelay_ingest::writer::{IndexerWriter, PgWriter, WriterError};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../../migrations/0001_blockrelay.sql");

// Concurrent CREATE TABLE IF NOT EXISTS can still collide in the catalog.
static SCHEMA_APPLIED: OnceCell<()> = OnceCell::const_new();

async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let pool = PgPool::connect(&url)
        .await
        .expect("Failed to connect to test database");
    SCHEMA_APPLIED
        .get_or_init(|| async {
            sqlx::raw_sql(SCHEMA)
                .execute(&pool)
                .await
                .expect("Failed to apply schema");
        })
        .await;
    Some(pool)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Heights well above anything real so parallel runs do not collide.
fn unique_height() -> u64 {
    let id = Uuid::new_v4().as_u128() as u64;
    (1 << 40) + (id >> 24)
}

fn block(height: u64) -> Block {
    Block::from_value(json!({
        "block": { "header": { "height": height, "hash": "ef".repeat(32) } },
        "shards": [
            { "shard_id": 0, "receipt_execution_outcomes": [{ "id": 1 }, { "id": 2 }] },
            { "shard_id": 1, "receipt_execution_outcomes": [{ "id": 3 }] }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_pg_dead_letter_insert_or_increment() {
    let Some(pool) = test_pool().await else { return };
    let tracker = PgDeadLetterTracker::new(pool);
    let key = DeadLetterKey::new(unique("contract"), "wasm_parse", "v1");

    assert_eq!(tracker.record_failure(&key, "first").await.unwrap(), 1);
    assert_eq!(tracker.record_failure(&key, "second").await.unwrap(), 2);

    let record = tracker.get(&key).await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.last_error, "second");
}

#[tokio::test]
async fn test_pg_dead_letter_concurrent_increments() {
    let Some(pool) = test_pool().await else { return };
    let tracker = Arc::new(PgDeadLetterTracker::new(pool));
    let key = DeadLetterKey::new(unique("height"), "delivery_exhausted", "object-store");

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let tracker = tracker.clone();
            let key = key.clone();
            tokio::spawn(async move { tracker.record_failure(&key, "err").await.unwrap() })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(tracker.get(&key).await.unwrap().unwrap().attempts, 20);
    assert!(tracker.list(20).await.unwrap().iter().any(|r| r.key == key));
}

#[tokio::test]
async fn test_pg_writer_is_idempotent() {
    let Some(pool) = test_pool().await else { return };
    let writer = PgWriter::new(pool);
    let events = StreamerMessageNormalizer.normalize(&block(unique_height())).unwrap();

    assert_eq!(writer.write(&events).await.unwrap(), 3);
    assert_eq!(writer.write(&events).await.unwrap(), 0);
}

#[tokio::test]
async fn test_pg_checkpoint_keeps_greatest_height() {
    let Some(pool) = test_pool().await else { return };
    let writer = PgWriter::new(pool);
    let stream = unique("stream");
    let hash: BlockHash = "ab".repeat(32).parse().unwrap();

    writer.save_checkpoint(&stream, 200, &hash, 1).await.unwrap();
    writer.save_checkpoint(&stream, 150, &hash, 1).await.unwrap();

    let checkpoint = writer.load_checkpoint(&stream).await.unwrap().unwrap();
    assert_eq!(checkpoint.height, 200);
    assert_eq!(checkpoint.block_hash, hash);
}

#[tokio::test]
async fn test_pg_checkpoint_refuses_stale_token() {
    let Some(pool) = test_pool().await else { return };
    let writer = PgWriter::new(pool);
    let stream = unique("stream");
    let hash: BlockHash = "ab".repeat(32).parse().unwrap();

    writer.save_checkpoint(&stream, 10, &hash, 2).await.unwrap();
    assert!(matches!(
        writer.save_checkpoint(&stream, 11, &hash, 1).await,
        Err(WriterError::Fenced { token: 1, .. })
    ));

    writer.save_checkpoint(&stream, 12, &hash, 3).await.unwrap();
    let checkpoint = writer.load_checkpoint(&stream).await.unwrap().unwrap();
    assert_eq!(checkpoint.height, 12);
    assert_eq!(checkpoint.fencing_token, 3);
}

#[tokio::test]
async fn test_pg_coordination_cas() {
    let Some(pool) = test_pool().await else { return };
    let store = PgCoordinationStore::new(pool);
    let key = unique("lease");

    let CasOutcome::Swapped { version } = store.compare_and_swap(&key, None, vec![1]).await.unwrap()
    else {
        panic!("create failed");
    };
    assert!(matches!(
        store.compare_and_swap(&key, None, vec![2]).await.unwrap(),
        CasOutcome::Conflict { current: Some(_) }
    ));
    assert!(matches!(
        store.compare_and_swap(&key, Some(version), vec![3]).await.unwrap(),
        CasOutcome::Swapped { .. }
    ));
    assert!(matches!(
        store.compare_and_swap(&key, Some(version), vec![4]).await.unwrap(),
        CasOutcome::Conflict { .. }
    ));
    assert_eq!(store.get(&key).await.unwrap().unwrap().value, vec![3]);
}

#[tokio::test]
async fn test_pg_lease_mutual_exclusion() {
    let Some(pool) = test_pool().await else { return };
    let leases = LeaseCoordinator::new(
        Arc::new(PgCoordinationStore::new(pool)),
        Arc::new(SystemClock),
    );
    let stream = unique("stream");
    let ttl = Duration::from_secs(30);

    let lease = leases.acquire(&stream, "worker-a", ttl).await.unwrap();
    assert!(matches!(
        leases.acquire(&stream, "worker-b", ttl).await,
        Err(LeaseError::Denied { .. })
    ));

    assert!(leases.release(lease).await.unwrap());
    let next = leases.acquire(&stream, "worker-b", ttl).await.unwrap();
    assert_eq!(next.fencing_token, 2);
}
