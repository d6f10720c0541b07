//! S3-compatible object storage: client, block provider and durable sink

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};
use blockrelay_common::{Block, SourceTag};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{decode_block, BlockSource, SourceError};
use crate::config::ObjectStoreConfig;
use crate::queue::{DurableSink, SinkError};

/// Thin S3 client bound to one bucket
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl ObjectStore {
    /// Build a client. Static credentials are used when configured, otherwise
    /// the default AWS provider chain.
    pub async fn new(config: ObjectStoreConfig) -> Result<Self> {
        debug!(bucket = %config.bucket, region = %config.region, "Initializing object store");

        let client = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "blockrelay-storage");

                let mut builder = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
                    .force_path_style(config.path_style);

                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }

                Client::from_conf(builder.build())
            },
            _ => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;

                let mut builder =
                    aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.path_style);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }

                Client::from_conf(builder.build())
            },
        };

        info!(bucket = %config.bucket, "Object store client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Prefix-qualified key for a relative name
    pub fn key(&self, name: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    /// Fetch an object. `Ok(None)` when the key does not exist.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to get s3://{}/{}", self.bucket, key)));
            },
        };

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded object");
        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<UploadResult> {
        let checksum = calculate_sha256(&data);
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", self.bucket, key))?;

        debug!(bucket = %self.bucket, checksum = %checksum, "Uploaded object");

        Ok(UploadResult {
            key: key.to_string(),
            checksum,
            size,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub key: String,
    pub checksum: String,
    pub size: usize,
}

fn calculate_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Blocks mirrored into our own bucket under `<prefix>/<height:012>.json`
pub struct ObjectStoreSource {
    store: ObjectStore,
}

impl ObjectStoreSource {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub fn key_for(&self, height: u64) -> String {
        self.store.key(&Block::storage_name(height))
    }
}

#[async_trait]
impl BlockSource for ObjectStoreSource {
    fn tag(&self) -> SourceTag {
        SourceTag::ObjectStore
    }

    async fn fetch(&self, height: u64) -> std::result::Result<Arc<Block>, SourceError> {
        let key = self.key_for(height);
        match self.store.get(&key).await {
            Ok(Some(bytes)) => decode_block(SourceTag::ObjectStore, height, &bytes),
            Ok(None) => Err(SourceError::not_found(
                SourceTag::ObjectStore,
                format!("no object at {key}"),
            )),
            Err(e) => Err(SourceError::transient(SourceTag::ObjectStore, format!("{e:#}"))),
        }
    }
}

#[async_trait]
impl DurableSink for ObjectStoreSource {
    fn name(&self) -> &str {
        "object-store"
    }

    async fn put(&self, block: &Block) -> std::result::Result<(), SinkError> {
        let key = self.key_for(block.height);
        let result = self
            .store
            .put(&key, block.to_vec()?)
            .await
            .map_err(|e| SinkError::ObjectStore(format!("{e:#}")))?;

        info!(
            height = block.height,
            key = %result.key,
            size = result.size,
            "Mirrored block to object store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: &str) -> ObjectStore {
        ObjectStore {
            client: Client::from_conf(
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .region(Region::new("us-east-1"))
                    .build(),
            ),
            bucket: "blocks".to_string(),
            prefix: prefix.to_string(),
        }
    }

    #[test]
    fn test_key_with_prefix() {
        let source = ObjectStoreSource::new(store("/mainnet/blocks/"));
        assert_eq!(source.key_for(100), "mainnet/blocks/000000000100.json");
    }

    #[test]
    fn test_key_without_prefix() {
        let source = ObjectStoreSource::new(store(""));
        assert_eq!(source.key_for(7), "000000000007.json");
    }

    #[test]
    fn test_calculate_sha256() {
        assert_eq!(
            calculate_sha256(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
