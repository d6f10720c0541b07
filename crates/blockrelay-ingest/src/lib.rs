//! Blockrelay Ingest Library
//!
//! Resilient block ingestion: fetch blocks by height from a chain of
//! providers, write their events exactly once, and keep a single writer per
//! stream across any number of processes.
//!
//! # Components
//!
//! - [`cache`]: bounded LRU of recently seen blocks
//! - [`source`]: cache, disk, object-store, lake and direct-API providers
//! - [`fetcher`]: tries providers in order and tracks their health
//! - [`queue`]: retry/upload queue with exponential backoff
//! - [`lease`]: lease-based stream ownership over a CAS store
//! - [`dead_letter`]: insert-or-increment failure records
//! - [`writer`]: idempotent event persistence and checkpoints
//! - [`metrics`]: Prometheus counters and gauges
//! - [`pipeline`]: the stream worker tying it all together
//!
//! # Example
//!
//! ```no_run
//! use blockrelay_ingest::{cache::BlockCache, config::IngestConfig, fetcher::FallbackFetcher, source::SourceSet};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let cache = Arc::new(BlockCache::new(config.cache_capacity()));
//!     let sources = SourceSet::build(&config.sources, cache.clone()).await?;
//!     let fetcher = FallbackFetcher::new(cache, sources.ordered, config.genesis_height);
//!
//!     let result = fetcher.fetch(config.genesis_height).await?;
//!     tracing::info!(source = %result.source, hash = %result.block.hash, "fetched");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod fetcher;
pub mod lease;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod writer;
