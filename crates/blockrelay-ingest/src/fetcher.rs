//! Fallback fetcher
//!
//! Tries each provider in the configured order until one returns the block.
//! The order is fixed; health counters are kept for observability only and
//! never change which provider is asked first.

use blockrelay_common::{Block, SourceTag};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cache::BlockCache;
use crate::metrics;
use crate::source::{BlockSource, SourceError, SourceErrorKind};

/// A block and where it came from
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub block: Arc<Block>,
    pub source: SourceTag,
}

/// Every provider's failure for one height, in the order they were tried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailures(pub Vec<SourceError>);

impl fmt::Display for SourceFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no sources configured");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// No chain data exists below genesis. Never retried.
    #[error("height {height} is below genesis height {genesis}")]
    BeforeGenesis { height: u64, genesis: u64 },

    /// Every provider failed. Worth retrying later.
    #[error("all sources failed for height {height}: {failures}")]
    Exhausted { height: u64, failures: SourceFailures },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Exhausted { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

pub struct FallbackFetcher {
    cache: Arc<BlockCache>,
    sources: Vec<Arc<dyn BlockSource>>,
    genesis_height: u64,
    health: Mutex<HashMap<SourceTag, SourceHealth>>,
}

impl FallbackFetcher {
    pub fn new(cache: Arc<BlockCache>, sources: Vec<Arc<dyn BlockSource>>, genesis_height: u64) -> Self {
        let health = sources
            .iter()
            .map(|s| (s.tag(), SourceHealth::default()))
            .collect();

        Self {
            cache,
            sources,
            genesis_height,
            health: Mutex::new(health),
        }
    }

    pub fn order(&self) -> Vec<SourceTag> {
        self.sources.iter().map(|s| s.tag()).collect()
    }

    pub fn genesis_height(&self) -> u64 {
        self.genesis_height
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, height: u64) -> Result<FetchResult, FetchError> {
        if height < self.genesis_height {
            return Err(FetchError::BeforeGenesis {
                height,
                genesis: self.genesis_height,
            });
        }

        let mut failures = Vec::new();

        for source in &self.sources {
            let tag = source.tag();
            match source.fetch(height).await {
                Ok(block) => {
                    self.record_success(tag);
                    if tag != SourceTag::Cache {
                        self.cache.put(height, block.clone());
                    }
                    debug!(height, source = %tag, hash = %block.hash, "Fetched block");
                    return Ok(FetchResult { block, source: tag });
                },
                Err(e) => {
                    debug!(height, source = %tag, error = %e, "Source failed, trying next");
                    self.record_failure(&e);
                    failures.push(e);
                },
            }
        }

        warn!(height, sources = failures.len(), "All sources failed");
        Err(FetchError::Exhausted {
            height,
            failures: SourceFailures(failures),
        })
    }

    /// Drop a block from the cache, e.g. after it failed a continuity check.
    pub fn evict(&self, height: u64) -> Option<Arc<Block>> {
        self.cache.remove(height)
    }

    /// Health counters per provider, in fetch order.
    pub fn health(&self) -> Vec<(SourceTag, SourceHealth)> {
        let health = self.health.lock();
        self.sources
            .iter()
            .map(|s| {
                let tag = s.tag();
                (tag, health.get(&tag).cloned().unwrap_or_default())
            })
            .collect()
    }

    fn record_success(&self, tag: SourceTag) {
        let mut health = self.health.lock();
        let entry = health.entry(tag).or_default();
        entry.consecutive_failures = 0;
        entry.total_successes += 1;
        metrics::record_fetch(tag, "ok");
    }

    fn record_failure(&self, error: &SourceError) {
        let mut health = self.health.lock();
        let entry = health.entry(error.tag).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.total_failures += 1;
        entry.last_error = Some(error.to_string());

        let outcome = match error.kind {
            SourceErrorKind::NotFound => "not_found",
            SourceErrorKind::Transient => "transient",
            SourceErrorKind::Permanent => "permanent",
        };
        metrics::record_fetch(error.tag, outcome);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::tests::test_block;
    use crate::source::{CacheSource, SourceErrorKind};
    use async_trait::async_trait;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider with a fixed set of blocks and a fixed failure mode for
    /// everything else.
    pub(crate) struct StubSource {
        pub tag: SourceTag,
        pub blocks: Mutex<HashMap<u64, Arc<Block>>>,
        pub miss: SourceErrorKind,
        pub calls: AtomicU32,
    }

    impl StubSource {
        pub(crate) fn new(tag: SourceTag, miss: SourceErrorKind) -> Self {
            Self {
                tag,
                blocks: Mutex::new(HashMap::new()),
                miss,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn with_blocks(self, blocks: impl IntoIterator<Item = Arc<Block>>) -> Self {
            self.blocks
                .lock()
                .extend(blocks.into_iter().map(|b| (b.height, b)));
            self
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlockSource for StubSource {
        fn tag(&self) -> SourceTag {
            self.tag
        }

        async fn fetch(&self, height: u64) -> Result<Arc<Block>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.blocks
                .lock()
                .get(&height)
                .cloned()
                .ok_or_else(|| SourceError::new(self.tag, self.miss, format!("no block {height}")))
        }
    }

    fn cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::new(NonZeroUsize::new(16).unwrap()))
    }

    #[tokio::test]
    async fn test_object_store_hit_after_cache_and_disk_miss() {
        let cache = cache();
        let disk = Arc::new(StubSource::new(SourceTag::Disk, SourceErrorKind::NotFound));
        let s3 = Arc::new(
            StubSource::new(SourceTag::ObjectStore, SourceErrorKind::NotFound)
                .with_blocks([test_block(100)]),
        );
        let lake = Arc::new(StubSource::new(SourceTag::LakeStream, SourceErrorKind::Transient));

        let fetcher = FallbackFetcher::new(
            cache.clone(),
            vec![
                Arc::new(CacheSource::new(cache.clone())) as Arc<dyn BlockSource>,
                disk.clone(),
                s3.clone(),
                lake.clone(),
            ],
            0,
        );

        let result = fetcher.fetch(100).await.unwrap();
        assert_eq!(result.source, SourceTag::ObjectStore);
        assert_eq!(result.block.height, 100);
        assert!(cache.contains(100));
        assert_eq!(lake.calls(), 0);

        // Second fetch is served by the cache
        let again = fetcher.fetch(100).await.unwrap();
        assert_eq!(again.source, SourceTag::Cache);
        assert_eq!(s3.calls(), 1);
        assert_eq!(disk.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_moves_on() {
        let broken = Arc::new(StubSource::new(SourceTag::ObjectStore, SourceErrorKind::Permanent));
        let api = Arc::new(
            StubSource::new(SourceTag::DirectApi, SourceErrorKind::NotFound)
                .with_blocks([test_block(5)]),
        );
        let fetcher = FallbackFetcher::new(cache(), vec![broken as Arc<dyn BlockSource>, api], 0);

        let result = fetcher.fetch(5).await.unwrap();
        assert_eq!(result.source, SourceTag::DirectApi);

        let health = fetcher.health();
        assert_eq!(health[0].0, SourceTag::ObjectStore);
        assert_eq!(health[0].1.consecutive_failures, 1);
        assert!(health[0].1.last_error.as_deref().unwrap().contains("permanent"));
        assert_eq!(health[1].1.total_successes, 1);
    }

    #[tokio::test]
    async fn test_all_sources_fail() {
        let fetcher = FallbackFetcher::new(
            cache(),
            vec![
                Arc::new(StubSource::new(SourceTag::Disk, SourceErrorKind::NotFound)) as Arc<dyn BlockSource>,
                Arc::new(StubSource::new(SourceTag::LakeStream, SourceErrorKind::Transient)),
            ],
            0,
        );

        let err = fetcher.fetch(9).await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            FetchError::Exhausted { height, failures } => {
                assert_eq!(height, 9);
                let tags: Vec<_> = failures.0.iter().map(|f| f.tag).collect();
                assert_eq!(tags, vec![SourceTag::Disk, SourceTag::LakeStream]);
            },
            other => panic!("expected exhaustion, got {other:?}"),
        }

        fetcher.fetch(10).await.unwrap_err();
        assert_eq!(fetcher.health()[1].1.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_before_genesis_consults_nobody() {
        let disk = Arc::new(StubSource::new(SourceTag::Disk, SourceErrorKind::NotFound));
        let fetcher = FallbackFetcher::new(cache(), vec![disk.clone() as Arc<dyn BlockSource>], 1_000);

        let err = fetcher.fetch(999).await.unwrap_err();
        assert_eq!(err, FetchError::BeforeGenesis { height: 999, genesis: 1_000 });
        assert!(!err.is_retryable());
        assert_eq!(disk.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let flaky = Arc::new(StubSource::new(SourceTag::Disk, SourceErrorKind::Transient));
        let fetcher = FallbackFetcher::new(cache(), vec![flaky.clone() as Arc<dyn BlockSource>], 0);

        fetcher.fetch(1).await.unwrap_err();
        flaky.blocks.lock().insert(2, test_block(2));
        fetcher.fetch(2).await.unwrap();

        let health = &fetcher.health()[0].1;
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 1);
        assert_eq!(health.total_successes, 1);
        assert_eq!(fetcher.order(), vec![SourceTag::Disk]);
    }
}
