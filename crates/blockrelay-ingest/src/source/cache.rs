//! Hot cache provider

use async_trait::async_trait;
use blockrelay_common::{Block, SourceTag};
use std::sync::Arc;

use super::{BlockSource, SourceError};
use crate::cache::BlockCache;

/// Serves blocks already held in the in-process cache
pub struct CacheSource {
    cache: Arc<BlockCache>,
}

impl CacheSource {
    pub fn new(cache: Arc<BlockCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl BlockSource for CacheSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Cache
    }

    async fn fetch(&self, height: u64) -> Result<Arc<Block>, SourceError> {
        self.cache
            .get(height)
            .ok_or_else(|| SourceError::not_found(SourceTag::Cache, "cache miss"))
    }
}
