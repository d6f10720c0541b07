//! Durable sinks the retry queue delivers to

use async_trait::async_trait;
use blockrelay_common::{Block, RelayError};
use std::sync::Arc;
use thiserror::Error;

use crate::normalize::{BlockNormalizer, NormalizeError};
use crate::writer::{IndexerWriter, WriterError};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] RelayError),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),
}

/// Somewhere a block must eventually land. Keys are derived from the height,
/// so repeated puts of the same block are harmless.
#[async_trait]
pub trait DurableSink: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, block: &Block) -> Result<(), SinkError>;
}

/// Normalizes a block and writes its events through the indexer writer.
pub struct IndexSink {
    normalizer: Arc<dyn BlockNormalizer>,
    writer: Arc<dyn IndexerWriter>,
}

impl IndexSink {
    pub fn new(normalizer: Arc<dyn BlockNormalizer>, writer: Arc<dyn IndexerWriter>) -> Self {
        Self { normalizer, writer }
    }
}

#[async_trait]
impl DurableSink for IndexSink {
    fn name(&self) -> &str {
        "index"
    }

    async fn put(&self, block: &Block) -> Result<(), SinkError> {
        let events = self.normalizer.normalize(block)?;
        let inserted = self.writer.write(&events).await?;
        tracing::debug!(height = block.height, inserted, "Indexed block from retry queue");
        Ok(())
    }
}
