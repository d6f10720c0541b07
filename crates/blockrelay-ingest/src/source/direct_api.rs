//! Direct data API provider
//!
//! Last-resort HTTP source: `GET <base>/v0/block/<height>`. The API answers
//! `null` for heights that were skipped or are not produced yet, and rate
//! limits aggressively, so 429 is treated as transient.

use async_trait::async_trait;
use blockrelay_common::{Block, SourceTag};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use super::{decode_value, BlockSource, SourceError};
use crate::config::DirectApiConfig;

pub struct DirectApiSource {
    client: reqwest::Client,
    base_url: String,
}

impl DirectApiSource {
    pub fn new(config: &DirectApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("blockrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, height: u64) -> String {
        format!("{}/v0/block/{}", self.base_url, height)
    }
}

fn classify_status(status: StatusCode) -> Option<super::SourceErrorKind> {
    use super::SourceErrorKind::*;

    if status.is_success() {
        None
    } else if status == StatusCode::NOT_FOUND {
        Some(NotFound)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(Transient)
    } else {
        Some(Permanent)
    }
}

#[async_trait]
impl BlockSource for DirectApiSource {
    fn tag(&self) -> SourceTag {
        SourceTag::DirectApi
    }

    async fn fetch(&self, height: u64) -> Result<Arc<Block>, SourceError> {
        let tag = SourceTag::DirectApi;
        let url = self.url_for(height);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::transient(tag, format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if let Some(kind) = classify_status(status) {
            return Err(SourceError::new(tag, kind, format!("{url} returned {status}")));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceError::permanent(tag, format!("invalid JSON body: {e}")))?;

        if value.is_null() {
            return Err(SourceError::not_found(tag, format!("no block at height {height}")));
        }

        decode_value(tag, height, value)
    }
}
