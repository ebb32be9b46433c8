//! Read access to the search engine.
//!
//! The API only needs two primitives: fetch one document by id and run a
//! query body. Both return `_source` documents; decoding into view types is
//! left to [`crate::services`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::ElasticConfig;

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// `_source` of document `id`, or `None` if it does not exist.
    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>>;

    /// `_source` of every hit of `body`, in hit order.
    async fn search(&self, index: &str, body: &Value) -> Result<Vec<Value>>;
}

pub struct ElasticSearch {
    client: reqwest::Client,
    base_url: String,
}

impl ElasticSearch {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
        })
    }
}

#[async_trait]
impl SearchEngine for ElasticSearch {
    async fn get(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(format!("{}/{}/_doc/{}", self.base_url, index, id))
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Elasticsearch get error {}: {}", status, body_text);
        }

        let json: Value = resp.json().await?;
        Ok(json.get("_source").cloned())
    }

    async fn search(&self, index: &str, body: &Value) -> Result<Vec<Value>> {
        let resp = self
            .client
            .post(format!("{}/{}/_search", self.base_url, index))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        // Index not created yet
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Elasticsearch search error {}: {}", status, body_text);
        }

        let json: Value = resp.json().await?;
        Ok(extract_sources(&json))
    }
}

pub fn extract_sources(json: &Value) -> Vec<Value> {
    json.pointer("/hits/hits")
        .and_then(|hits| hits.as_array())
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_source").cloned())
                .collect()
        })
        .unwrap_or_default()
}
