//! Block source providers
//!
//! Every backend that can produce a block for a height implements
//! [`BlockSource`]. Providers are independent: each one reports a typed
//! failure and never retries internally. The [`FallbackFetcher`] decides what
//! to try next.
//!
//! [`FallbackFetcher`]: crate::fetcher::FallbackFetcher

use async_trait::async_trait;
use blockrelay_common::{Block, SourceTag};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::BlockCache;
use crate::config::SourcesConfig;

pub mod cache;
pub mod direct_api;
pub mod disk;
pub mod lake;
pub mod object_store;

pub use cache::CacheSource;
pub use direct_api::DirectApiSource;
pub use disk::DiskSource;
pub use lake::LakeSource;
pub use object_store::{ObjectStore, ObjectStoreSource};

/// How a provider failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// The provider does not (yet) have this height.
    NotFound,
    /// Network trouble, rate limiting, timeouts.
    Transient,
    /// Malformed response or out-of-range request. Retrying the same
    /// provider for the same height will not help.
    Permanent,
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceErrorKind::NotFound => f.write_str("not found"),
            SourceErrorKind::Transient => f.write_str("transient failure"),
            SourceErrorKind::Permanent => f.write_str("permanent failure"),
        }
    }
}

/// A single provider's failure for a single height
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{tag}: {kind}: {reason}")]
pub struct SourceError {
    pub tag: SourceTag,
    pub kind: SourceErrorKind,
    pub reason: String,
}

impl SourceError {
    pub fn new(tag: SourceTag, kind: SourceErrorKind, reason: impl Into<String>) -> Self {
        Self {
            tag,
            kind,
            reason: reason.into(),
        }
    }

    pub fn not_found(tag: SourceTag, reason: impl Into<String>) -> Self {
        Self::new(tag, SourceErrorKind::NotFound, reason)
    }

    pub fn transient(tag: SourceTag, reason: impl Into<String>) -> Self {
        Self::new(tag, SourceErrorKind::Transient, reason)
    }

    pub fn permanent(tag: SourceTag, reason: impl Into<String>) -> Self {
        Self::new(tag, SourceErrorKind::Permanent, reason)
    }
}

/// Capability to fetch one block by height
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn tag(&self) -> SourceTag;

    async fn fetch(&self, height: u64) -> Result<Arc<Block>, SourceError>;
}

/// Decode a raw JSON document into the block for `height`.
///
/// Undecodable documents and documents for another height are permanent
/// failures of the provider that returned them.
pub(crate) fn decode_block(
    tag: SourceTag,
    height: u64,
    bytes: &[u8],
) -> Result<Arc<Block>, SourceError> {
    let block = Block::from_slice(bytes)
        .map_err(|e| SourceError::permanent(tag, format!("undecodable block: {e}")))?;
    check_height(tag, height, block)
}

/// Same as [`decode_block`] for an already parsed document.
pub(crate) fn decode_value(
    tag: SourceTag,
    height: u64,
    value: serde_json::Value,
) -> Result<Arc<Block>, SourceError> {
    let block = Block::from_value(value)
        .map_err(|e| SourceError::permanent(tag, format!("undecodable block: {e}")))?;
    check_height(tag, height, block)
}

fn check_height(tag: SourceTag, height: u64, block: Block) -> Result<Arc<Block>, SourceError> {
    if block.height != height {
        return Err(SourceError::permanent(
            tag,
            format!("requested height {height}, got {}", block.height),
        ));
    }
    Ok(Arc::new(block))
}

/// Providers built from configuration, in priority order.
///
/// The object-store and disk providers are also durable sinks, so they are
/// handed back separately for the mirror queue.
pub struct SourceSet {
    pub ordered: Vec<Arc<dyn BlockSource>>,
    pub object_store: Option<Arc<ObjectStoreSource>>,
    pub disk: Option<Arc<DiskSource>>,
}

impl SourceSet {
    /// Build every configured provider. Tags listed in the order but not
    /// configured are skipped with a warning.
    pub async fn build(config: &SourcesConfig, cache: Arc<BlockCache>) -> anyhow::Result<Self> {
        let disk = config
            .disk_dir
            .as_ref()
            .map(|dir| Arc::new(DiskSource::new(dir.clone())));

        let object_store = match &config.object_store {
            Some(cfg) => Some(Arc::new(ObjectStoreSource::new(
                ObjectStore::new(cfg.clone()).await?,
            ))),
            None => None,
        };

        let lake = match &config.lake {
            Some(cfg) => Some(Arc::new(LakeSource::new(ObjectStore::new(cfg.clone()).await?))),
            None => None,
        };

        let direct_api = match &config.direct_api {
            Some(cfg) => Some(Arc::new(DirectApiSource::new(cfg)?)),
            None => None,
        };

        let mut ordered: Vec<Arc<dyn BlockSource>> = Vec::with_capacity(config.order.len());
        for tag in &config.order {
            let source: Option<Arc<dyn BlockSource>> = match tag {
                SourceTag::Cache => Some(Arc::new(CacheSource::new(cache.clone()))),
                SourceTag::Disk => disk.clone().map(|s| s as Arc<dyn BlockSource>),
                SourceTag::ObjectStore => object_store.clone().map(|s| s as Arc<dyn BlockSource>),
                SourceTag::LakeStream => lake.clone().map(|s| s as Arc<dyn BlockSource>),
                SourceTag::DirectApi => direct_api.clone().map(|s| s as Arc<dyn BlockSource>),
            };

            match source {
                Some(source) => ordered.push(source),
                None => tracing::warn!(source = %tag, "Source listed in order but not configured, skipping"),
            }
        }

        tracing::info!(
            order = ?ordered.iter().map(|s| s.tag()).collect::<Vec<_>>(),
            "Block sources ready"
        );

        Ok(Self {
            ordered,
            object_store,
            disk,
        })
    }
}
