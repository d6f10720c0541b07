//! Block normalization
//!
//! Turns a block document into the rows the indexer writer persists. Each
//! event has a natural key `(block_height, shard_id, event_index)` that is
//! stable across re-runs, which is what makes writes idempotent.

use blockrelay_common::{Block, BlockHash};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const EVENT_RECEIPT_OUTCOME: &str = "receipt_outcome";
pub const EVENT_BLOCK: &str = "block";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub block_height: u64,
    pub block_hash: BlockHash,
    pub shard_id: u32,
    pub event_index: u32,
    pub event_type: String,
    pub data: Value,
}

impl NormalizedEvent {
    pub fn natural_key(&self) -> (u64, u32, u32) {
        (self.block_height, self.shard_id, self.event_index)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot normalize block {height}: {reason}")]
pub struct NormalizeError {
    pub height: u64,
    pub reason: String,
}

pub trait BlockNormalizer: Send + Sync {
    fn normalize(&self, block: &Block) -> Result<Vec<NormalizedEvent>, NormalizeError>;
}

/// Normalizer for streamer messages: `{ block, shards: [{ shard_id,
/// receipt_execution_outcomes: [...] }] }`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamerMessageNormalizer;

impl StreamerMessageNormalizer {
    fn block_event(block: &Block) -> NormalizedEvent {
        let header = block
            .payload
            .get("block")
            .and_then(|b| b.get("header"))
            .cloned()
            .unwrap_or(Value::Null);

        NormalizedEvent {
            block_height: block.height,
            block_hash: block.hash,
            shard_id: 0,
            event_index: 0,
            event_type: EVENT_BLOCK.to_string(),
            data: header,
        }
    }
}

impl BlockNormalizer for StreamerMessageNormalizer {
    fn normalize(&self, block: &Block) -> Result<Vec<NormalizedEvent>, NormalizeError> {
        let fail = |reason: String| NormalizeError {
            height: block.height,
            reason,
        };

        let shards = match block.payload.get("shards") {
            None | Some(Value::Null) => return Ok(vec![Self::block_event(block)]),
            Some(Value::Array(shards)) => shards,
            Some(_) => return Err(fail("`shards` is not an array".to_string())),
        };

        if shards.is_empty() {
            return Ok(vec![Self::block_event(block)]);
        }

        let mut events = Vec::new();
        for (position, shard) in shards.iter().enumerate() {
            let shard = shard
                .as_object()
                .ok_or_else(|| fail(format!("shard #{position} is not an object")))?;

            let shard_id = match shard.get("shard_id") {
                Some(id) => id
                    .as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| fail(format!("shard #{position} has invalid shard_id {id}")))?,
                None => u32::try_from(position).map_err(|_| fail("too many shards".to_string()))?,
            };

            let outcomes = match shard.get("receipt_execution_outcomes") {
                None | Some(Value::Null) => continue,
                Some(Value::Array(outcomes)) => outcomes,
                Some(_) => {
                    return Err(fail(format!(
                        "shard {shard_id} receipt_execution_outcomes is not an array"
                    )))
                },
            };

            for (index, outcome) in outcomes.iter().enumerate() {
                let event_index = u32::try_from(index)
                    .map_err(|_| fail(format!("shard {shard_id} has too many outcomes")))?;
                events.push(NormalizedEvent {
                    block_height: block.height,
                    block_hash: block.hash,
                    shard_id,
                    event_index,
                    event_type: EVENT_RECEIPT_OUTCOME.to_string(),
                    data: outcome.clone(),
                });
            }
        }

        Ok(events)
    }
}
