//! Configuration management
//!
//! Everything is read from the environment (a `.env` file is loaded by the
//! binary first). Unset or empty variables fall back to the `DEFAULT_*`
//! values. A variable that is set but does not parse is an error.

use anyhow::Context;
use blockrelay_common::SourceTag;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::BackoffPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/blockrelay";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of blocks held in memory.
pub const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 1_000;

pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Region of the public lake buckets.
pub const DEFAULT_LAKE_REGION: &str = "eu-central-1";

pub const DEFAULT_DIRECT_API_URL: &str = "https://mainnet.neardata.xyz";

pub const DEFAULT_DIRECT_API_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_RETRY_INITIAL_SECS: u64 = 5;

pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

pub const DEFAULT_RETRY_MAX_SECS: u64 = 300;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Default number of queued deliveries in flight at once.
pub const DEFAULT_UPLOAD_PARALLELISM: usize = 4;

pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// Default wait between lease acquisition attempts while another worker
/// holds the stream.
pub const DEFAULT_LEASE_RETRY_SECS: u64 = 5;

pub const DEFAULT_GENESIS_HEIGHT: u64 = 9_820_210;

/// Default wait before asking for a height that no source had yet.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 700;

/// Default time the worker keeps its lease after stopping so queued index
/// writes can land.
pub const DEFAULT_INDEX_DRAIN_SECS: u64 = 30;

// ============================================================================
// Types
// ============================================================================

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub cache_capacity: usize,
    pub sources: SourcesConfig,
    pub retry: RetryConfig,
    pub upload_parallelism: usize,
    pub lease_ttl_secs: u64,
    pub lease_retry_secs: u64,
    pub genesis_height: u64,
    pub poll_interval_ms: u64,
    pub index_drain_secs: u64,
    /// Prometheus scrape endpoint; no exporter when unset.
    pub metrics_addr: Option<SocketAddr>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Which providers exist and in what order they are tried
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub order: Vec<SourceTag>,
    pub disk_dir: Option<PathBuf>,
    pub object_store: Option<ObjectStoreConfig>,
    pub lake: Option<ObjectStoreConfig>,
    pub direct_api: Option<DirectApiConfig>,
}

/// S3-compatible bucket settings, shared by the mirror bucket and the lake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    #[serde(skip_serializing)]
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

/// Backoff parameters for the retry queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_secs: u64,
    pub multiplier: f64,
    pub max_secs: u64,
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_secs),
            multiplier: self.multiplier,
            cap: Duration::from_secs(self.max_secs),
            max_attempts: self.max_attempts,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {name} {raw:?}: {e}")),
        None => Ok(None),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(lookup, name)?.unwrap_or(default))
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl IngestConfig {
    /// Load configuration from the process environment and validate it
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let order = match non_empty(&lookup, "SOURCE_ORDER") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.parse::<SourceTag>())
                .collect::<Result<Vec<_>, _>>()
                .context("Invalid SOURCE_ORDER")?,
            None => SourceTag::DEFAULT_ORDER.to_vec(),
        };

        let object_store = match non_empty(&lookup, "S3_BUCKET") {
            Some(bucket) => Some(ObjectStoreConfig {
                endpoint: non_empty(&lookup, "S3_ENDPOINT"),
                region: non_empty(&lookup, "S3_REGION")
                    .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                bucket,
                prefix: lookup("S3_PREFIX").unwrap_or_default(),
                access_key: non_empty(&lookup, "S3_ACCESS_KEY"),
                secret_key: non_empty(&lookup, "S3_SECRET_KEY"),
                path_style: parse_or(&lookup, "S3_PATH_STYLE", false)?,
            }),
            None => None,
        };

        let lake = non_empty(&lookup, "LAKE_BUCKET").map(|bucket| ObjectStoreConfig {
            endpoint: non_empty(&lookup, "LAKE_ENDPOINT"),
            region: non_empty(&lookup, "LAKE_REGION")
                .unwrap_or_else(|| DEFAULT_LAKE_REGION.to_string()),
            bucket,
            prefix: String::new(),
            access_key: None,
            secret_key: None,
            path_style: false,
        });

        // An explicitly empty DIRECT_API_URL disables the provider.
        let direct_api = match lookup("DIRECT_API_URL") {
            Some(url) if url.trim().is_empty() => None,
            url => Some(DirectApiConfig {
                base_url: url.unwrap_or_else(|| DEFAULT_DIRECT_API_URL.to_string()),
                timeout_secs: parse_or(&lookup, "DIRECT_API_TIMEOUT_SECS", DEFAULT_DIRECT_API_TIMEOUT_SECS)?,
            }),
        };

        let config = IngestConfig {
            database: DatabaseConfig {
                url: non_empty(&lookup, "DATABASE_URL")
                    .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
                connect_timeout_secs: parse_or(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            cache_capacity: parse_or(&lookup, "BLOCK_CACHE_CAPACITY", DEFAULT_BLOCK_CACHE_CAPACITY)?,
            sources: SourcesConfig {
                order,
                disk_dir: non_empty(&lookup, "DISK_CACHE_DIR").map(PathBuf::from),
                object_store,
                lake,
                direct_api,
            },
            retry: RetryConfig {
                initial_secs: parse_or(&lookup, "RETRY_INITIAL_SECS", DEFAULT_RETRY_INITIAL_SECS)?,
                multiplier: parse_or(&lookup, "RETRY_MULTIPLIER", DEFAULT_RETRY_MULTIPLIER)?,
                max_secs: parse_or(&lookup, "RETRY_MAX_SECS", DEFAULT_RETRY_MAX_SECS)?,
                max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS)?,
            },
            upload_parallelism: parse_or(&lookup, "UPLOAD_PARALLELISM", DEFAULT_UPLOAD_PARALLELISM)?,
            lease_ttl_secs: parse_or(&lookup, "LEASE_TTL_SECS", DEFAULT_LEASE_TTL_SECS)?,
            lease_retry_secs: parse_or(&lookup, "LEASE_RETRY_SECS", DEFAULT_LEASE_RETRY_SECS)?,
            genesis_height: parse_or(&lookup, "GENESIS_HEIGHT", DEFAULT_GENESIS_HEIGHT)?,
            poll_interval_ms: parse_or(&lookup, "POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?,
            index_drain_secs: parse_or(&lookup, "INDEX_DRAIN_SECS", DEFAULT_INDEX_DRAIN_SECS)?,
            metrics_addr: parse_opt(&lookup, "METRICS_ADDR")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.cache_capacity == 0 {
            anyhow::bail!("BLOCK_CACHE_CAPACITY must be greater than 0");
        }

        if self.sources.order.is_empty() {
            anyhow::bail!("SOURCE_ORDER must name at least one source");
        }

        for (i, tag) in self.sources.order.iter().enumerate() {
            if self.sources.order[..i].contains(tag) {
                anyhow::bail!("SOURCE_ORDER lists {} more than once", tag);
            }
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            anyhow::bail!(
                "RETRY_MULTIPLIER must be a finite number >= 1.0, got {}",
                self.retry.multiplier
            );
        }

        if self.retry.initial_secs > self.retry.max_secs {
            anyhow::bail!(
                "RETRY_INITIAL_SECS ({}) cannot be greater than RETRY_MAX_SECS ({})",
                self.retry.initial_secs,
                self.retry.max_secs
            );
        }

        if self.upload_parallelism == 0 {
            anyhow::bail!("UPLOAD_PARALLELISM must be greater than 0");
        }

        // Renewal runs at a third of the TTL and needs whole seconds to work with.
        if self.lease_ttl_secs < 3 {
            anyhow::bail!("LEASE_TTL_SECS must be at least 3, got {}", self.lease_ttl_secs);
        }

        if self.sources.order.iter().all(|t| *t == SourceTag::Cache) {
            tracing::warn!("Only the cache source is enabled; nothing new will be fetched");
        }

        Ok(())
    }

    pub fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_secs(self.lease_retry_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn index_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.index_drain_secs)
    }
}
