//! Common types used across blockrelay
//!
//! A [`Block`] is an immutable, height-identified unit of chain data. The
//! payload is kept as the upstream JSON document (a streamer message) and is
//! never interpreted here beyond the header fields needed for identity.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, Result};

/// Length of a block hash in bytes.
pub const BLOCK_HASH_LEN: usize = 32;

// ============================================================================
// Block Hash
// ============================================================================

/// Fixed-length block hash.
///
/// Textual form is base58, as upstream headers carry it. Parsing also accepts
/// 64-character hex for hashes written by older mirrors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; BLOCK_HASH_LEN]);

impl BlockHash {
    pub const fn new(bytes: [u8; BLOCK_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_HASH_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; BLOCK_HASH_LEN] = bytes.try_into().map_err(|_| {
            RelayError::InvalidHash(format!(
                "expected {} bytes, got {}",
                BLOCK_HASH_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl FromStr for BlockHash {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        // 64 hex characters never decode to 32 bytes as base58, so the
        // encodings cannot be confused.
        let bytes = if s.len() == BLOCK_HASH_LEN * 2 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            hex::decode(s).map_err(|e| RelayError::InvalidHash(format!("{s}: {e}")))?
        } else {
            bs58::decode(s)
                .into_vec()
                .map_err(|e| RelayError::InvalidHash(format!("{s}: {e}")))?
        };
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Block
// ============================================================================

/// An immutable block as delivered by an upstream source.
///
/// `height` is the total-order key, `hash` the consistency check. The payload
/// is the full upstream document; the header fields are read from
/// `block.header.{height,hash,prev_hash}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub height: u64,
    pub hash: BlockHash,
    pub prev_hash: Option<BlockHash>,
    pub payload: serde_json::Value,
}

impl Block {
    /// Build a block from an upstream JSON document.
    pub fn from_value(payload: serde_json::Value) -> Result<Self> {
        let header = payload
            .get("block")
            .and_then(|b| b.get("header"))
            .ok_or_else(|| RelayError::MalformedBlock("missing block.header".to_string()))?;

        let height = header
            .get("height")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| RelayError::MalformedBlock("missing block.header.height".to_string()))?;

        let hash = header
            .get("hash")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| RelayError::MalformedBlock("missing block.header.hash".to_string()))?
            .parse()?;

        let prev_hash = match header.get("prev_hash") {
            Some(serde_json::Value::String(s)) => Some(s.parse()?),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                return Err(RelayError::MalformedBlock(format!(
                    "block.header.prev_hash is not a string: {other}"
                )))
            },
        };

        Ok(Self {
            height,
            hash,
            prev_hash,
            payload,
        })
    }

    /// Decode a block from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Encode the block back into the upstream JSON document.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    /// Storage key used by object-store and disk providers.
    pub fn storage_name(height: u64) -> String {
        format!("{:012}.json", height)
    }
}

// ============================================================================
// Source Tag
// ============================================================================

/// Provenance of a fetched block.
///
/// Used for observability and source-health accounting; never stored inside
/// the block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    Cache,
    Disk,
    ObjectStore,
    LakeStream,
    DirectApi,
}

impl SourceTag {
    /// Default priority order, cheapest first.
    pub const DEFAULT_ORDER: [SourceTag; 5] = [
        SourceTag::Cache,
        SourceTag::Disk,
        SourceTag::ObjectStore,
        SourceTag::LakeStream,
        SourceTag::DirectApi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Cache => "cache",
            SourceTag::Disk => "disk",
            SourceTag::ObjectStore => "object-store",
            SourceTag::LakeStream => "lake-stream",
            SourceTag::DirectApi => "direct-api",
        }
    }

    /// Whether blocks from this source should be mirrored into the object
    /// store so later fetches hit a cheaper provider.
    pub fn is_upstream(&self) -> bool {
        match self {
            SourceTag::LakeStream | SourceTag::DirectApi => true,
            SourceTag::Cache | SourceTag::Disk | SourceTag::ObjectStore => false,
        }
    }
}

impl FromStr for SourceTag {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cache" => Ok(SourceTag::Cache),
            "disk" => Ok(SourceTag::Disk),
            "object-store" | "object_store" | "s3" => Ok(SourceTag::ObjectStore),
            "lake-stream" | "lake_stream" | "lake" => Ok(SourceTag::LakeStream),
            "direct-api" | "direct_api" | "api" => Ok(SourceTag::DirectApi),
            other => Err(RelayError::UnknownSource(other.to_string())),
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn hash_hex(byte: u8) -> String {
        hex::encode([byte; BLOCK_HASH_LEN])
    }

    #[test]
    fn test_block_from_value() {
        let payload = json!({
            "block": {
                "header": {
                    "height": 100,
                    "hash": hash_hex(1),
                    "prev_hash": hash_hex(2),
                }
            },
            "shards": []
        });

        let block = Block::from_value(payload.clone()).unwrap();
        assert_eq!(block.height, 100);
        assert_eq!(block.hash, BlockHash::new([1; BLOCK_HASH_LEN]));
        assert_eq!(block.prev_hash, Some(BlockHash::new([2; BLOCK_HASH_LEN])));
        assert_eq!(block.payload, payload);
    }

    #[test]
    fn test_block_with_base58_header() {
        let payload = json!({
            "block": {
                "author": "node0",
                "header": {
                    "height": 100,
                    "hash": "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi",
                    "prev_hash": "8qbHbw2BbbTHBW1sbeqakYXVKRQM8Ne7pLK7m6CVfeR",
                },
                "chunks": []
            },
            "shards": []
        });

        let block = Block::from_value(payload).unwrap();
        assert_eq!(block.hash, BlockHash::new([1; BLOCK_HASH_LEN]));
        assert_eq!(block.prev_hash, Some(BlockHash::new([2; BLOCK_HASH_LEN])));
    }

    #[test]
    fn test_block_hash_text_forms() {
        let hash = BlockHash::new([0xab; BLOCK_HASH_LEN]);
        assert_eq!(hash.to_string(), "CZ8YUVdk7znjrUmnb5n7kgySk9yRAsQDYmyCxzfSky9t");

        let from_hex: BlockHash = "ab".repeat(32).parse().unwrap();
        assert_eq!(from_hex, hash);

        let leading_zero: BlockHash = "1thX6LZfHDZZKUs92febYZhYRcXddmzfzF2NvTkPNE".parse().unwrap();
        assert_eq!(&leading_zero.as_bytes()[..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_block_hash_rejects_bad_base58() {
        // '0' and 'l' are outside the base58 alphabet
        assert!("0lO".parse::<BlockHash>().is_err());
        // Valid base58, wrong length
        assert!("4vJ9JU1bJJE96FWSJKvHsm".parse::<BlockHash>().is_err());
    }

    #[test]
    fn test_block_without_prev_hash() {
        let payload = json!({ "block": { "header": { "height": 1, "hash": hash_hex(9) } } });
        let block = Block::from_value(payload).unwrap();
        assert_eq!(block.prev_hash, None);
    }

    #[test]
    fn test_block_missing_header_is_malformed() {
        let err = Block::from_value(json!({ "shards": [] })).unwrap_err();
        assert!(matches!(err, RelayError::MalformedBlock(_)));
    }

    #[test]
    fn test_block_short_hash_rejected() {
        let payload = json!({ "block": { "header": { "height": 1, "hash": "abcd" } } });
        assert!(matches!(
            Block::from_value(payload).unwrap_err(),
            RelayError::InvalidHash(_)
        ));
    }

    #[test]
    fn test_storage_name_is_zero_padded() {
        assert_eq!(Block::storage_name(100), "000000000100.json");
    }

    #[test]
    fn test_source_tag_from_str() {
        assert_eq!("cache".parse::<SourceTag>().unwrap(), SourceTag::Cache);
        assert_eq!("S3".parse::<SourceTag>().unwrap(), SourceTag::ObjectStore);
        assert_eq!("lake".parse::<SourceTag>().unwrap(), SourceTag::LakeStream);
        assert_eq!("direct-api".parse::<SourceTag>().unwrap(), SourceTag::DirectApi);
        assert!("ftp".parse::<SourceTag>().is_err());
    }

    #[test]
    fn test_upstream_sources() {
        let upstream: Vec<_> = SourceTag::DEFAULT_ORDER
            .iter()
            .filter(|t| t.is_upstream())
            .collect();
        assert_eq!(upstream, vec![&SourceTag::LakeStream, &SourceTag::DirectApi]);
    }

    proptest! {
        #[test]
        fn prop_block_hash_text_form_parses_back(bytes in any::<[u8; 32]>()) {
            let hash = BlockHash::new(bytes);
            let parsed: BlockHash = hash.to_string().parse().unwrap();
            prop_assert_eq!(parsed, hash);
        }
    }
}
