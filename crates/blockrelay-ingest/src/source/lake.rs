//! Data lake provider
//!
//! The lake publishes one folder per height in a public bucket:
//! `<height:012>/block.json` holds the block view (`author`, `header`,
//! `chunks`) and `<height:012>/shard_<n>.json` holds shard `n`, one file per
//! chunk. The provider stitches them into the same `{block, shards}` streamer
//! message the other providers return.
//!
//! The lake trails the chain tip by a few seconds, so a missing key near the
//! tip is reported as not found rather than an error.

use async_trait::async_trait;
use blockrelay_common::{Block, SourceTag};
use futures::future::try_join_all;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{decode_value, BlockSource, ObjectStore, SourceError};

pub struct LakeSource {
    store: ObjectStore,
}

impl LakeSource {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub fn block_key(&self, height: u64) -> String {
        self.store.key(&format!("{:012}/block.json", height))
    }

    pub fn shard_key(&self, height: u64, shard: usize) -> String {
        self.store.key(&format!("{:012}/shard_{}.json", height, shard))
    }

    async fn get_json(&self, key: String) -> Result<Value, SourceError> {
        match self.store.get(&key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).map_err(|e| {
                SourceError::permanent(SourceTag::LakeStream, format!("undecodable {key}: {e}"))
            }),
            Ok(None) => Err(SourceError::not_found(
                SourceTag::LakeStream,
                format!("{key} not published yet"),
            )),
            Err(e) => Err(SourceError::transient(SourceTag::LakeStream, format!("{e:#}"))),
        }
    }
}

/// Number of shard files that belong to a block view.
pub(crate) fn shard_count(block_view: &Value) -> Result<usize, SourceError> {
    block_view
        .get("chunks")
        .and_then(Value::as_array)
        .map(Vec::len)
        .ok_or_else(|| SourceError::permanent(SourceTag::LakeStream, "block.json has no chunks list"))
}

/// Build a streamer message from a block view and its shards, in shard order.
pub(crate) fn assemble(block_view: Value, shards: Vec<Value>) -> Value {
    json!({ "block": block_view, "shards": shards })
}

#[async_trait]
impl BlockSource for LakeSource {
    fn tag(&self) -> SourceTag {
        SourceTag::LakeStream
    }

    async fn fetch(&self, height: u64) -> Result<Arc<Block>, SourceError> {
        let block_view = self.get_json(self.block_key(height)).await?;
        let shards = shard_count(&block_view)?;

        let shards =
            try_join_all((0..shards).map(|shard| self.get_json(self.shard_key(height, shard)))).await?;

        decode_value(SourceTag::LakeStream, height, assemble(block_view, shards))
    }
}
