//! Local disk provider and sink
//!
//! Blocks live as `<dir>/<height:012>.json`, the same document the upstream
//! sources return. Writes go through a temporary file and a rename so a
//! reader never sees a partial block.

use async_trait::async_trait;
use blockrelay_common::{Block, SourceTag};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use super::{decode_block, BlockSource, SourceError};
use crate::queue::{DurableSink, SinkError};

pub struct DiskSource {
    dir: PathBuf,
}

impl DiskSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, height: u64) -> PathBuf {
        self.dir.join(Block::storage_name(height))
    }

    /// Write a block to disk atomically.
    #[instrument(skip(self, block), fields(height = block.height))]
    pub async fn store(&self, block: &Block) -> Result<PathBuf, SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(block.height);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, block.to_vec()?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(path = %path.display(), "Stored block on disk");
        Ok(path)
    }
}

#[async_trait]
impl BlockSource for DiskSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Disk
    }

    async fn fetch(&self, height: u64) -> Result<Arc<Block>, SourceError> {
        let path = self.path_for(height);
        match tokio::fs::read(&path).await {
            Ok(bytes) => decode_block(SourceTag::Disk, height, &bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SourceError::not_found(
                SourceTag::Disk,
                format!("{} does not exist", path.display()),
            )),
            Err(e) => Err(SourceError::transient(
                SourceTag::Disk,
                format!("failed to read {}: {e}", path.display()),
            )),
        }
    }
}

#[async_trait]
impl DurableSink for DiskSource {
    fn name(&self) -> &str {
        "disk"
    }

    async fn put(&self, block: &Block) -> Result<(), SinkError> {
        self.store(block).await.map(|_| ())
    }
}
