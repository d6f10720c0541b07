//! Blockrelay Ingest - resilient block ingestion worker

use anyhow::{Context, Result};
use blockrelay_common::logging::{init_logging, LogConfig, LogLevel};
use blockrelay_ingest::{
    cache::BlockCache,
    clock::{Clock, SystemClock},
    config::{DatabaseConfig, IngestConfig},
    dead_letter::{DeadLetterTracker, MemoryDeadLetterTracker, PgDeadLetterTracker},
    fetcher::FallbackFetcher,
    metrics::{self, init_metrics},
    lease::{CoordinationStore, LeaseCoordinator, MemoryCoordinationStore, PgCoordinationStore},
    normalize::{BlockNormalizer, StreamerMessageNormalizer},
    pipeline::{StreamWorker, StreamWorkerConfig, DEFAULT_MAX_DISCONTINUITY_RETRIES},
    queue::{DurableSink, IndexSink, UploadQueue},
    source::SourceSet,
    writer::{IndexerWriter, MemoryWriter, PgWriter},
};
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How long queued mirror uploads get to finish after the worker stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between health reports.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "blockrelay-ingest")]
#[command(author, version, about = "Resilient block ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a stream while holding its lease
    Run {
        /// Logical stream name; one worker per name at a time
        #[arg(short, long, env = "STREAM_NAME", default_value = "mainnet")]
        stream: String,

        /// First height when the stream has no checkpoint
        #[arg(long, env = "START_HEIGHT")]
        start_height: Option<u64>,

        /// Last height to ingest (inclusive)
        #[arg(long, env = "STOP_HEIGHT")]
        stop_height: Option<u64>,

        /// Keep writer, leases and dead letters in memory instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,
    },

    /// Fetch one block through the source chain and report where it came from
    Fetch {
        height: u64,
    },

    /// List recorded dead letters as JSON lines
    DeadLetters {
        /// Only show records with at least this many attempts
        #[arg(long, default_value_t = 5)]
        min_attempts: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("blockrelay-ingest")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Invalid configuration")?;

    if let Some(addr) = config.metrics_addr {
        init_metrics(addr)?;
    }

    match cli.command {
        Command::Run {
            stream,
            start_height,
            stop_height,
            dry_run,
        } => run(config, stream, start_height, stop_height, dry_run).await?,
        Command::Fetch { height } => fetch(config, height).await?,
        Command::DeadLetters { min_attempts } => dead_letters(config, min_attempts).await?,
    }

    Ok(())
}

async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await
        .context("Failed to connect to database")?;

    info!(max_connections = config.max_connections, "Connected to database");
    Ok(pool)
}

fn holder_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

async fn run(
    config: IngestConfig,
    stream: String,
    start_height: Option<u64>,
    stop_height: Option<u64>,
    dry_run: bool,
) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(BlockCache::new(config.cache_capacity()));
    let sources = SourceSet::build(&config.sources, cache.clone())
        .await
        .context("Failed to build block sources")?;
    let fetcher = Arc::new(FallbackFetcher::new(
        cache.clone(),
        sources.ordered.clone(),
        config.genesis_height,
    ));

    let (writer, dead_letters, store): (
        Arc<dyn IndexerWriter>,
        Arc<dyn DeadLetterTracker>,
        Arc<dyn CoordinationStore>,
    ) = if dry_run {
        warn!("Dry run: nothing is persisted and leases are local to this process");
        (
            Arc::new(MemoryWriter::new()),
            Arc::new(MemoryDeadLetterTracker::with_clock(clock.clone())),
            Arc::new(MemoryCoordinationStore::new()),
        )
    } else {
        let pool = connect(&config.database).await?;
        (
            Arc::new(PgWriter::new(pool.clone())),
            Arc::new(PgDeadLetterTracker::new(pool.clone())),
            Arc::new(PgCoordinationStore::new(pool)),
        )
    };

    let normalizer: Arc<dyn BlockNormalizer> = Arc::new(StreamerMessageNormalizer);
    let policy = config.retry.policy();

    // Index retries write to the stream, so they only run under its lease.
    let index_queue = Arc::new(
        UploadQueue::new(
            Arc::new(IndexSink::new(normalizer.clone(), writer.clone())),
            dead_letters.clone(),
            policy,
            config.upload_parallelism,
            clock.clone(),
        )
        .gated(),
    );

    // Mirror upstream blocks into the shared bucket when there is one,
    // otherwise into the local directory.
    let mirror_sink: Option<Arc<dyn DurableSink>> = match (&sources.object_store, &sources.disk) {
        (Some(bucket), _) => Some(bucket.clone() as Arc<dyn DurableSink>),
        (None, Some(disk)) => Some(disk.clone() as Arc<dyn DurableSink>),
        (None, None) => None,
    };
    let mirror_queue = mirror_sink.map(|sink| {
        Arc::new(UploadQueue::new(
            sink,
            dead_letters.clone(),
            policy,
            config.upload_parallelism,
            clock.clone(),
        ))
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                shutdown_tx.send_replace(true);
            }
        }
    });

    let (queue_stop_tx, queue_stop_rx) = watch::channel(false);
    let mirror_queues: Vec<_> = mirror_queue.iter().cloned().collect();
    let mut queues = vec![index_queue.clone()];
    queues.extend(mirror_queues.iter().cloned());
    let queue_handles: Vec<_> = queues
        .iter()
        .map(|q| tokio::spawn(q.clone().run(queue_stop_rx.clone())))
        .collect();

    let health_handle = tokio::spawn({
        let fetcher = fetcher.clone();
        let cache = cache.clone();
        let queues = queues.clone();
        async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                report_health(&cache, &fetcher, &queues);
            }
        }
    });

    let worker = StreamWorker::new(
        StreamWorkerConfig {
            stream_name: stream,
            holder_id: holder_id(),
            start_height,
            stop_height,
            lease_ttl: config.lease_ttl(),
            lease_retry_interval: config.lease_retry_interval(),
            poll_interval: config.poll_interval(),
            max_discontinuity_retries: DEFAULT_MAX_DISCONTINUITY_RETRIES,
            index_drain_timeout: config.index_drain_timeout(),
        },
        fetcher.clone(),
        normalizer,
        writer,
        Arc::new(LeaseCoordinator::new(store, clock)),
        dead_letters,
        index_queue,
        mirror_queue,
    );

    // The worker drains index retries itself before giving up the lease;
    // whatever is left there belongs to the next lease holder.
    let result = worker.run(shutdown_rx.clone()).await;

    drain(&mirror_queues, shutdown_rx).await;
    queue_stop_tx.send_replace(true);
    for handle in queue_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Retry queue task failed");
        }
    }
    health_handle.abort();
    report_health(&cache, &fetcher, &queues);

    let summary = result?;
    info!(
        processed = summary.processed,
        events = summary.events_written,
        last_height = ?summary.last_height,
        "Ingestion complete"
    );
    Ok(())
}

/// Give the queues a bounded amount of time to empty, unless shutdown was
/// requested.
async fn drain(queues: &[Arc<UploadQueue>], shutdown: watch::Receiver<bool>) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while queues.iter().any(|q| q.stats().pending > 0) {
        if *shutdown.borrow() || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn report_health(cache: &BlockCache, fetcher: &FallbackFetcher, queues: &[Arc<UploadQueue>]) {
    let stats = cache.stats();
    metrics::set_cache_stats(&stats);
    info!(
        cache_size = stats.len,
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        "Cache health"
    );

    for (tag, health) in fetcher.health() {
        info!(
            source = %tag,
            successes = health.total_successes,
            failures = health.total_failures,
            consecutive_failures = health.consecutive_failures,
            last_error = health.last_error.as_deref().unwrap_or(""),
            "Source health"
        );
    }

    for queue in queues {
        let stats = queue.stats();
        metrics::set_queue_stats(queue.name(), &stats);
        info!(
            queue = %queue.name(),
            pending = stats.pending,
            delivered = stats.delivered,
            dead_lettered = stats.dead_lettered,
            "Queue health"
        );
    }
}

async fn fetch(config: IngestConfig, height: u64) -> Result<()> {
    let cache = Arc::new(BlockCache::new(config.cache_capacity()));
    let sources = SourceSet::build(&config.sources, cache.clone())
        .await
        .context("Failed to build block sources")?;
    let fetcher = FallbackFetcher::new(cache, sources.ordered, config.genesis_height);

    let result = fetcher.fetch(height).await?;
    let events = StreamerMessageNormalizer.normalize(&result.block)?;

    info!(
        height,
        source = %result.source,
        hash = %result.block.hash,
        prev_hash = ?result.block.prev_hash,
        events = events.len(),
        "Fetched block"
    );
    Ok(())
}

async fn dead_letters(config: IngestConfig, min_attempts: u32) -> Result<()> {
    let pool = connect(&config.database).await?;
    let tracker = PgDeadLetterTracker::new(pool);

    let records = tracker.list(min_attempts).await?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }

    info!(count = records.len(), min_attempts, "Listed dead letters");
    Ok(())
}
