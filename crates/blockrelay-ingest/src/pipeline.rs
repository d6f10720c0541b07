//! Stream worker
//!
//! Advances one named stream while holding its lease:
//!
//! 1. Acquire the lease, waiting while another worker holds it.
//! 2. Resume from the stored checkpoint (or the configured start height).
//! 3. For each height: fetch, check the parent hash against the previous
//!    block, normalize, write, checkpoint. Writes that fail go to the index
//!    retry queue; blocks from upstream sources are also queued for mirroring.
//!
//! Heights are handled strictly in order. Nothing is written for the stream
//! once the lease is gone: the fence is checked before every height and again
//! right before the write, the index retry queue is gated on the same fence,
//! and checkpoints carry the lease's fencing token. A write already in
//! progress is allowed to finish.

use blockrelay_common::{Block, BlockHash, SourceTag};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterError, DeadLetterKey, DeadLetterTracker};
use crate::fetcher::{FallbackFetcher, FetchError, FetchResult};
use crate::lease::{LeaseCoordinator, LeaseError, LeaseFence, LeaseKeeper};
use crate::metrics;
use crate::normalize::BlockNormalizer;
use crate::queue::UploadQueue;
use crate::writer::{IndexerWriter, WriterError};

/// Dead-letter error types recorded by the worker
pub const ERROR_BEFORE_GENESIS: &str = "before_genesis";
pub const ERROR_CHAIN_DISCONTINUITY: &str = "chain_discontinuity";
pub const ERROR_NORMALIZE: &str = "normalize";
pub const ERROR_INDEX_ENQUEUE: &str = "index_enqueue";

pub const DEFAULT_MAX_DISCONTINUITY_RETRIES: u32 = 3;

/// Poll interval while waiting for the index retry queue to empty.
const DRAIN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct StreamWorkerConfig {
    pub stream_name: String,
    pub holder_id: String,
    /// First height when the stream has no checkpoint. Defaults to genesis.
    pub start_height: Option<u64>,
    /// Last height to handle, inclusive.
    pub stop_height: Option<u64>,
    pub lease_ttl: Duration,
    pub lease_retry_interval: Duration,
    pub poll_interval: Duration,
    /// Parent-hash mismatches tolerated for one height before it is skipped.
    pub max_discontinuity_retries: u32,
    /// After reaching the stop height, how long to keep the lease while
    /// deferred index writes land.
    pub index_drain_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum StopReason {
    #[default]
    Shutdown,
    StopHeight,
    LeaseLost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub events_written: u64,
    /// Blocks whose write failed and were handed to the index retry queue.
    pub deferred: u64,
    pub mirrored: u64,
    pub dead_lettered: u64,
    pub last_height: Option<u64>,
    pub stop_reason: StopReason,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Could not load checkpoint: {0}")]
    Checkpoint(#[from] WriterError),
}

pub struct StreamWorker {
    config: StreamWorkerConfig,
    fetcher: Arc<FallbackFetcher>,
    normalizer: Arc<dyn BlockNormalizer>,
    writer: Arc<dyn IndexerWriter>,
    leases: Arc<LeaseCoordinator>,
    dead_letters: Arc<dyn DeadLetterTracker>,
    index_queue: Arc<UploadQueue>,
    mirror_queue: Option<Arc<UploadQueue>>,
}

impl StreamWorker {
    /// `index_queue` should be built with [`UploadQueue::gated`]; the worker
    /// opens it only while the lease is held.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StreamWorkerConfig,
        fetcher: Arc<FallbackFetcher>,
        normalizer: Arc<dyn BlockNormalizer>,
        writer: Arc<dyn IndexerWriter>,
        leases: Arc<LeaseCoordinator>,
        dead_letters: Arc<dyn DeadLetterTracker>,
        index_queue: Arc<UploadQueue>,
        mirror_queue: Option<Arc<UploadQueue>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            normalizer,
            writer,
            leases,
            dead_letters,
            index_queue,
            mirror_queue,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary, PipelineError> {
        let stream = self.config.stream_name.as_str();

        let lease = loop {
            if *shutdown.borrow() {
                return Ok(RunSummary::default());
            }

            match self
                .leases
                .acquire(stream, &self.config.holder_id, self.config.lease_ttl)
                .await
            {
                Ok(lease) => break lease,
                Err(LeaseError::Denied { holder, expires_at, .. }) => {
                    info!(stream, holder = %holder, expires_at = %expires_at, "Stream is held elsewhere, waiting");
                },
                Err(LeaseError::Store(e)) => {
                    warn!(stream, error = %e, "Coordination store unavailable, retrying");
                },
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.lease_retry_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(RunSummary::default());
                    }
                }
            }
        };

        let keeper = LeaseKeeper::spawn(self.leases.clone(), lease);
        let fence = keeper.fence();
        self.index_queue.attach_gate(Arc::new(fence.clone()));

        let result = self.ingest(&keeper, &fence, &mut shutdown).await;

        self.index_queue.detach_gate();
        match keeper.release().await {
            Ok(true) => {},
            Ok(false) => debug!(stream, "Lease was not ours to release anymore"),
            Err(e) => warn!(stream, error = %e, "Failed to release lease, it will expire on its own"),
        }

        if let Ok(summary) = &result {
            info!(
                stream,
                processed = summary.processed,
                events = summary.events_written,
                deferred = summary.deferred,
                dead_lettered = summary.dead_lettered,
                last_height = ?summary.last_height,
                reason = ?summary.stop_reason,
                "Stream worker stopped"
            );
        }
        result
    }

    async fn ingest(
        &self,
        keeper: &LeaseKeeper,
        fence: &LeaseFence,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunSummary, PipelineError> {
        let stream = self.config.stream_name.as_str();
        let mut summary = RunSummary::default();
        let mut lost = keeper.lost();

        let checkpoint = self.writer.load_checkpoint(stream).await?;
        let (mut height, mut prev_hash) = match &checkpoint {
            Some(cp) => (cp.height.saturating_add(1), Some(cp.block_hash)),
            None => (
                self.config
                    .start_height
                    .unwrap_or_else(|| self.fetcher.genesis_height()),
                None,
            ),
        };
        info!(stream, height, resumed = checkpoint.is_some(), "Starting stream");

        let mut mismatches = 0u32;
        let mut last_handled: Option<(u64, BlockHash)> = None;

        loop {
            if let Err(e) = fence.check() {
                warn!(stream, height, error = %e, "Lease gone, stopping");
                summary.stop_reason = StopReason::LeaseLost;
                break;
            }
            if *shutdown.borrow() {
                summary.stop_reason = StopReason::Shutdown;
                break;
            }
            if self.config.stop_height.is_some_and(|stop| height > stop) {
                summary.stop_reason = StopReason::StopHeight;
                break;
            }

            let FetchResult { block, source } = match self.fetcher.fetch(height).await {
                Ok(result) => result,
                Err(FetchError::BeforeGenesis { genesis, .. }) => {
                    let key = DeadLetterKey::for_height(height, ERROR_BEFORE_GENESIS, stream);
                    self.record_dead_letter(&key, &format!("genesis is {genesis}"), &mut summary)
                        .await;
                    warn!(stream, height, genesis, "Requested height is before genesis, jumping ahead");
                    height = genesis;
                    continue;
                },
                Err(e @ FetchError::Exhausted { .. }) => {
                    debug!(stream, height, error = %e, "Block not available yet");
                    if let Some(reason) = self.pause(shutdown, &mut lost).await {
                        summary.stop_reason = reason;
                        break;
                    }
                    continue;
                },
            };

            if let (Some(expected), Some(parent)) = (prev_hash, block.prev_hash) {
                if expected != parent {
                    mismatches += 1;
                    self.fetcher.evict(height);

                    if mismatches <= self.config.max_discontinuity_retries {
                        warn!(
                            stream,
                            height,
                            expected = %expected,
                            parent = %parent,
                            source = %source,
                            "Parent hash mismatch, retrying"
                        );
                        if let Some(reason) = self.pause(shutdown, &mut lost).await {
                            summary.stop_reason = reason;
                            break;
                        }
                        continue;
                    }

                    let key = DeadLetterKey::for_height(height, ERROR_CHAIN_DISCONTINUITY, stream);
                    let reason = format!("expected parent {expected}, block has {parent}");
                    self.record_dead_letter(&key, &reason, &mut summary).await;
                    error!(stream, height, "Chain discontinuity persists, skipping height");

                    // The skipped block's hash is not trusted as anyone's
                    // parent; the next block starts a fresh chain.
                    mismatches = 0;
                    prev_hash = None;
                    summary.last_height = Some(height);
                    height += 1;
                    continue;
                }
            }
            mismatches = 0;

            if let Err(e) = self.handle_block(&block, source, fence, &mut summary).await {
                warn!(stream, height, error = %e, "Lease gone before the write, stopping");
                summary.stop_reason = StopReason::LeaseLost;
                break;
            }

            metrics::record_block(stream, height);
            prev_hash = Some(block.hash);
            last_handled = Some((height, block.hash));
            summary.last_height = Some(height);
            height += 1;
        }

        // On shutdown deferred writes are left behind; the checkpoint never
        // passed them, so the next run replays them.
        if summary.stop_reason == StopReason::StopHeight && self.drain_index_queue(fence).await {
            if let Some((height, hash)) = last_handled {
                if let Err(e) = self.save_checkpoint(height, &hash, fence).await {
                    warn!(stream, height, error = %e, "Final checkpoint refused");
                }
            }
        }

        Ok(summary)
    }

    /// Mirror, normalize, write and checkpoint one verified block. Fails only
    /// when the lease is gone, in which case nothing was written.
    async fn handle_block(
        &self,
        block: &Arc<Block>,
        source: SourceTag,
        fence: &LeaseFence,
        summary: &mut RunSummary,
    ) -> Result<(), LeaseError> {
        let stream = self.config.stream_name.as_str();
        let height = block.height;

        if source.is_upstream() {
            if let Some(mirror) = &self.mirror_queue {
                match mirror.enqueue_block(block.clone()) {
                    Ok(true) => summary.mirrored += 1,
                    Ok(false) => {},
                    Err(e) => warn!(stream, height, error = %e, "Could not queue block for mirroring"),
                }
            }
        }

        let events = match self.normalizer.normalize(block) {
            Ok(events) => events,
            Err(e) => {
                summary.processed += 1;
                let key = DeadLetterKey::for_height(height, ERROR_NORMALIZE, stream);
                self.record_dead_letter(&key, &e.to_string(), summary).await;
                return Ok(());
            },
        };

        fence.check()?;
        summary.processed += 1;

        match self.writer.write(&events).await {
            Ok(inserted) => {
                summary.events_written += inserted;
                self.save_checkpoint(height, &block.hash, fence).await?;
            },
            Err(e) => {
                warn!(stream, height, error = %e, "Write failed, handing block to retry queue");
                match self.index_queue.enqueue_block(block.clone()) {
                    Ok(_) => summary.deferred += 1,
                    Err(queue_err) => {
                        let key = DeadLetterKey::for_height(height, ERROR_INDEX_ENQUEUE, stream);
                        let reason = format!("{e}; {queue_err}");
                        self.record_dead_letter(&key, &reason, summary).await;
                    },
                }
            },
        }
        Ok(())
    }

    /// Move the checkpoint unless an earlier height is still waiting in the
    /// index retry queue. Resuming from an older checkpoint only replays
    /// idempotent writes. A refused fencing token means another worker owns
    /// the stream now.
    async fn save_checkpoint(&self, height: u64, hash: &BlockHash, fence: &LeaseFence) -> Result<(), LeaseError> {
        let stream = self.config.stream_name.as_str();
        if self
            .index_queue
            .lowest_pending()
            .is_some_and(|pending| pending < height)
        {
            debug!(stream, height, "Earlier height pending retry, holding checkpoint");
            return Ok(());
        }

        let token = fence.check()?;
        match self.writer.save_checkpoint(stream, height, hash, token).await {
            Ok(()) => Ok(()),
            Err(WriterError::Fenced { token, .. }) => {
                warn!(stream, height, token, "Checkpoint fenced off by a newer lease holder");
                Err(LeaseError::Expired {
                    stream: stream.to_string(),
                })
            },
            Err(e) => {
                warn!(stream, height, error = %e, "Failed to save checkpoint");
                Ok(())
            },
        }
    }

    /// Give deferred index writes a bounded time to land while the lease is
    /// still held. Returns whether the queue emptied.
    async fn drain_index_queue(&self, fence: &LeaseFence) -> bool {
        let stream = self.config.stream_name.as_str();
        let deadline = tokio::time::Instant::now() + self.config.index_drain_timeout;

        loop {
            if self.index_queue.lowest_pending().is_none() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if fence.check().is_err() || now >= deadline {
                warn!(
                    stream,
                    pending = self.index_queue.stats().pending,
                    "Index retry queue not drained, leaving the rest to the next run"
                );
                return false;
            }

            self.index_queue.process_due().await;
            if self.index_queue.lowest_pending().is_none() {
                return true;
            }
            tokio::time::sleep(DRAIN_POLL.min(deadline - now)).await;
        }
    }

    async fn record_dead_letter(&self, key: &DeadLetterKey, reason: &str, summary: &mut RunSummary) {
        summary.dead_lettered += 1;
        metrics::record_dead_letter(&key.error_type);
        match self.dead_letters.record_failure(key, reason).await {
            Ok(attempts) => warn!(key = %key, attempts, reason, "Recorded dead letter"),
            Err(DeadLetterError::Database(e)) => {
                error!(key = %key, reason, error = %e, "Could not record dead letter")
            },
        }
    }

    /// Sleep for the poll interval unless shutdown or lease loss comes first.
    async fn pause(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        lost: &mut watch::Receiver<bool>,
    ) -> Option<StopReason> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => None,
            changed = shutdown.changed() => {
                (changed.is_err() || *shutdown.borrow()).then_some(StopReason::Shutdown)
            }
            changed = lost.changed() => {
                (changed.is_err() || *lost.borrow()).then_some(StopReason::LeaseLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{test_block, test_block_with_parent};
    use crate::cache::BlockCache;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::dead_letter::MemoryDeadLetterTracker;
    use crate::fetcher::tests::StubSource;
    use crate::lease::MemoryCoordinationStore;
    use crate::normalize::StreamerMessageNormalizer;
    use crate::queue::{BackoffPolicy, DurableSink, IndexSink, SinkError};
    use crate::source::{BlockSource, SourceErrorKind};
    use crate::writer::MemoryWriter;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::num::NonZeroUsize;

    #[derive(Default)]
    struct RecordingSink {
        heights: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DurableSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn put(&self, block: &Block) -> Result<(), SinkError> {
            self.heights.lock().push(block.height);
            Ok(())
        }
    }

    struct Harness {
        source: Arc<StubSource>,
        writer: Arc<MemoryWriter>,
        leases: Arc<LeaseCoordinator>,
        dead_letters: Arc<MemoryDeadLetterTracker>,
        index_queue: Arc<UploadQueue>,
        mirror_queue: Arc<UploadQueue>,
        mirror_sink: Arc<RecordingSink>,
        fetcher: Arc<FallbackFetcher>,
    }

    const GENESIS: u64 = 10;

    fn harness(tag: SourceTag, blocks: Vec<Arc<Block>>) -> Harness {
        harness_with_clock(tag, blocks, Arc::new(SystemClock))
    }

    fn harness_with_clock(tag: SourceTag, blocks: Vec<Arc<Block>>, clock: Arc<dyn Clock>) -> Harness {
        let cache = Arc::new(BlockCache::new(NonZeroUsize::new(32).unwrap()));
        let source = Arc::new(StubSource::new(tag, SourceErrorKind::NotFound).with_blocks(blocks));
        let fetcher = Arc::new(FallbackFetcher::new(
            cache,
            vec![source.clone() as Arc<dyn BlockSource>],
            GENESIS,
        ));
        let writer = Arc::new(MemoryWriter::new());
        let dead_letters = Arc::new(MemoryDeadLetterTracker::new());
        let index_queue = Arc::new(
            UploadQueue::new(
                Arc::new(IndexSink::new(Arc::new(StreamerMessageNormalizer), writer.clone())),
                dead_letters.clone(),
                BackoffPolicy::default(),
                2,
                clock.clone(),
            )
            .gated(),
        );
        let mirror_sink = Arc::new(RecordingSink::default());
        let mirror_queue = Arc::new(UploadQueue::new(
            mirror_sink.clone(),
            dead_letters.clone(),
            BackoffPolicy::default(),
            2,
            clock.clone(),
        ));

        Harness {
            source,
            writer,
            leases: Arc::new(LeaseCoordinator::new(
                Arc::new(MemoryCoordinationStore::new()),
                clock,
            )),
            dead_letters,
            index_queue,
            mirror_queue,
            mirror_sink,
            fetcher,
        }
    }

    fn config(start: Option<u64>, stop: Option<u64>) -> StreamWorkerConfig {
        StreamWorkerConfig {
            stream_name: "mainnet".to_string(),
            holder_id: "worker-a".to_string(),
            start_height: start,
            stop_height: stop,
            lease_ttl: Duration::from_secs(30),
            lease_retry_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            max_discontinuity_retries: DEFAULT_MAX_DISCONTINUITY_RETRIES,
            index_drain_timeout: Duration::from_secs(5),
        }
    }

    fn worker(h: &Harness, config: StreamWorkerConfig) -> StreamWorker {
        StreamWorker::new(
            config,
            h.fetcher.clone(),
            Arc::new(StreamerMessageNormalizer),
            h.writer.clone(),
            h.leases.clone(),
            h.dead_letters.clone(),
            h.index_queue.clone(),
            Some(h.mirror_queue.clone()),
        )
    }

    fn chain(range: std::ops::RangeInclusive<u64>) -> Vec<Arc<Block>> {
        range.map(test_block).collect()
    }

    /// Block at `height` that is not on the test chain: its own hash and its
    /// parent are both foreign.
    fn forked_block(height: u64) -> Arc<Block> {
        Arc::new(
            Block::from_value(json!({
                "block": {
                    "header": {
                        "height": height,
                        "hash": hex::encode([0x99u8; 32]),
                        "prev_hash": hex::encode([0x98u8; 32]),
                    }
                },
                "shards": []
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_runs_from_genesis_to_stop_height() {
        let h = harness(SourceTag::ObjectStore, chain(10..=14));
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(None, Some(14))).run(rx).await.unwrap();

        assert_eq!(summary.stop_reason, StopReason::StopHeight);
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.last_height, Some(14));
        assert_eq!(summary.mirrored, 0);
        assert_eq!(h.writer.heights(), vec![10, 11, 12, 13, 14]);

        let checkpoint = h.writer.load_checkpoint("mainnet").await.unwrap().unwrap();
        assert_eq!(checkpoint.height, 14);
        assert_eq!(checkpoint.block_hash, test_block(14).hash);

        // Lease released on the way out
        assert!(h.leases.holder("mainnet").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resumes_after_checkpoint() {
        let h = harness(SourceTag::ObjectStore, chain(10..=14));
        h.writer
            .save_checkpoint("mainnet", 12, &test_block(12).hash, 1)
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(Some(10), Some(14))).run(rx).await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(h.writer.heights(), vec![13, 14]);
        assert_eq!(h.source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_goes_to_retry_queue() {
        let h = harness(SourceTag::Disk, chain(10..=12));
        h.writer.fail_next(1);
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(None, Some(12))).run(rx).await.unwrap();

        // The deferred write lands before the lease is let go, and the final
        // checkpoint covers everything
        assert_eq!(summary.deferred, 1);
        assert_eq!(h.writer.heights(), vec![10, 11, 12]);
        assert_eq!(h.index_queue.lowest_pending(), None);
        let checkpoint = h.writer.load_checkpoint("mainnet").await.unwrap().unwrap();
        assert_eq!(checkpoint.height, 12);
        assert!(h.leases.holder("mainnet").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_queue_stops_with_the_lease() {
        let h = harness(SourceTag::Disk, chain(10..=13));
        h.writer.fail_next(1);
        let (_tx, rx) = watch::channel(false);
        let config = StreamWorkerConfig {
            index_drain_timeout: Duration::ZERO,
            ..config(None, Some(13))
        };

        let summary = worker(&h, config).run(rx).await.unwrap();

        assert_eq!(summary.deferred, 1);
        assert!(h.leases.holder("mainnet").await.unwrap().is_none());
        // Height 10 is still owed, so the checkpoint must not pass it
        assert!(h.writer.load_checkpoint("mainnet").await.unwrap().is_none());

        // With the lease gone the queue holds on to the task
        assert!(h.index_queue.process_due().await.is_empty());
        assert_eq!(h.writer.heights(), vec![11, 12, 13]);
        assert!(h.index_queue.contains(10));
    }

    #[tokio::test]
    async fn test_upstream_blocks_are_mirrored() {
        let h = harness(SourceTag::LakeStream, chain(10..=11));
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(None, Some(11))).run(rx).await.unwrap();
        assert_eq!(summary.mirrored, 2);

        h.mirror_queue.process_due().await;
        assert_eq!(*h.mirror_sink.heights.lock(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_before_genesis_is_dead_lettered() {
        let h = harness(SourceTag::Disk, chain(10..=11));
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(Some(3), Some(11))).run(rx).await.unwrap();

        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.processed, 2);
        let key = DeadLetterKey::for_height(3, ERROR_BEFORE_GENESIS, "mainnet");
        assert_eq!(h.dead_letters.get(&key).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_discontinuity_is_skipped() {
        let mut blocks = chain(10..=11);
        blocks.push(test_block_with_parent(12, 99));
        blocks.push(test_block(13));
        let h = harness(SourceTag::Disk, blocks);
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(None, Some(13))).run(rx).await.unwrap();

        assert_eq!(h.writer.heights(), vec![10, 11, 13]);
        assert_eq!(summary.dead_lettered, 1);
        // One fetch per try: the first plus each retry, then 10, 11 and 13
        assert_eq!(h.source.calls(), 3 + DEFAULT_MAX_DISCONTINUITY_RETRIES + 1);

        let key = DeadLetterKey::for_height(12, ERROR_CHAIN_DISCONTINUITY, "mainnet");
        assert!(h.dead_letters.get(&key).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_after_skipped_fork_is_kept() {
        let mut blocks = chain(10..=11);
        blocks.push(forked_block(12));
        blocks.push(test_block(13));
        let h = harness(SourceTag::Disk, blocks);
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(None, Some(13))).run(rx).await.unwrap();

        // 13 does not descend from the skipped block, but it is not judged
        // against it either
        assert_eq!(h.writer.heights(), vec![10, 11, 13]);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(summary.stop_reason, StopReason::StopHeight);
        let checkpoint = h.writer.load_checkpoint("mainnet").await.unwrap().unwrap();
        assert_eq!(checkpoint.height, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_at_tip_until_shutdown() {
        let h = harness(SourceTag::Disk, chain(10..=11));
        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(worker(&h, config(None, None)));

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.writer.heights(), vec![10, 11]);
        assert!(h.leases.holder("mainnet").await.unwrap().is_some());

        tx.send(true).unwrap();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert_eq!(summary.last_height, Some(11));
        assert!(h.leases.holder("mainnet").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_lease_runs_out() {
        let clock = Arc::new(ManualClock::default());
        let h = harness_with_clock(SourceTag::Disk, chain(10..=11), clock.clone());
        let (_tx, rx) = watch::channel(false);
        let worker = Arc::new(worker(&h, config(None, None)));

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.writer.heights(), vec![10, 11]);

        // The lease runs out without a renewal and another worker takes it
        clock.advance(Duration::from_secs(31));
        h.leases
            .acquire("mainnet", "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        h.source.blocks.lock().insert(12, test_block(12));

        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.stop_reason, StopReason::LeaseLost);
        assert_eq!(summary.last_height, Some(11));
        assert_eq!(h.writer.heights(), vec![10, 11]);
        let (holder, _) = h.leases.holder("mainnet").await.unwrap().unwrap();
        assert_eq!(holder, "worker-b");
    }

    #[tokio::test]
    async fn test_stale_fencing_token_stops_worker() {
        let h = harness(SourceTag::Disk, chain(10..=12));
        // A later lease holder already checkpointed height 9
        h.writer
            .save_checkpoint("mainnet", 9, &test_block(9).hash, 5)
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let summary = worker(&h, config(None, Some(12))).run(rx).await.unwrap();

        assert_eq!(summary.stop_reason, StopReason::LeaseLost);
        assert_eq!(h.writer.heights(), vec![10]);
        let checkpoint = h.writer.load_checkpoint("mainnet").await.unwrap().unwrap();
        assert_eq!(checkpoint.height, 9);
        assert_eq!(checkpoint.fencing_token, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_lease_held_elsewhere() {
        let h = harness(SourceTag::Disk, chain(10..=11));
        let other = h
            .leases
            .acquire("mainnet", "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(worker(&h, config(None, Some(11))));

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.writer.heights().is_empty());

        // Once the other worker lets go, this one takes over
        h.leases.release(other).await.unwrap();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.processed, 2);
        drop(tx);
    }
}
