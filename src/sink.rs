//! Bulk upsert sink.
//!
//! [`ElasticSink`] submits one `_bulk` request per batch. Each record
//! becomes an `update` action with `doc_as_upsert`, so patch documents merge
//! into whatever already exists at that id and full documents create it.
//!
//! # Retry
//!
//! - network error, HTTP 429 or 5xx, or a 2xx whose body cannot be read →
//!   retry with exponential backoff
//!   (500ms, doubling, at most 30s per wait)
//! - other 4xx → fail immediately
//! - once the next wait would pass `elastic.backoff_max_secs` since the
//!   first attempt, the last error is returned

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ElasticConfig;
use crate::models::IndexDocument;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One `(id, document)` pair of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDoc {
    pub id: Uuid,
    pub doc: Value,
}

/// Converts records into their index representation.
pub fn prepare_bulk<R: IndexDocument>(records: &[R]) -> Vec<BulkDoc> {
    records
        .iter()
        .map(|r| BulkDoc {
            id: r.doc_id(),
            doc: r.to_document(),
        })
        .collect()
}

/// Per-item result counts of one bulk request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Reason reported for the first failed item.
    pub first_error: Option<String>,
}

#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Upserts `docs` into `index`. An empty slice is a no-op.
    async fn bulk_upsert(&self, index: &str, docs: &[BulkDoc]) -> Result<BulkOutcome>;
}

pub struct ElasticSink {
    client: reqwest::Client,
    base_url: String,
    backoff_max: Duration,
}

impl ElasticSink {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        })
    }
}

#[async_trait]
impl BulkSink for ElasticSink {
    async fn bulk_upsert(&self, index: &str, docs: &[BulkDoc]) -> Result<BulkOutcome> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let body = render_bulk(index, docs);
        let url = format!("{}/_bulk", self.base_url);
        let started = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let resp = self
                .client
                .post(&url)
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            let err = match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.json::<Value>().await {
                            Ok(json) => {
                                let outcome = parse_bulk_response(&json);
                                debug!(
                                    index,
                                    attempt,
                                    succeeded = outcome.succeeded,
                                    failed = outcome.failed,
                                    "bulk request done"
                                );
                                return Ok(outcome);
                            }
                            // Connection dropped mid-body; the upserts are idempotent.
                            Err(e) => {
                                anyhow::Error::new(e).context("Failed to read bulk response")
                            }
                        }
                    } else {
                        let body_text = response.text().await.unwrap_or_default();
                        if status.as_u16() != 429 && !status.is_server_error() {
                            bail!("Elasticsearch bulk error {}: {}", status, body_text);
                        }
                        anyhow!("Elasticsearch bulk error {}: {}", status, body_text)
                    }
                }
                Err(e) => anyhow::Error::new(e).context("Elasticsearch unreachable"),
            };

            if started.elapsed() + delay > self.backoff_max {
                return Err(err.context(format!(
                    "bulk request to '{}' gave up after {} attempts",
                    index, attempt
                )));
            }
            warn!(index, attempt, error = %err, "bulk request failed, retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
}

/// Renders the NDJSON body: an action line and a document line per record.
pub fn render_bulk(index: &str, docs: &[BulkDoc]) -> String {
    let mut body = String::new();
    for doc in docs {
        let action = json!({ "update": { "_index": index, "_id": doc.id } });
        let source = json!({ "doc": doc.doc, "doc_as_upsert": true });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&source.to_string());
        body.push('\n');
    }
    body
}

/// Counts per-item results in a `_bulk` response.
pub fn parse_bulk_response(json: &Value) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();

    let Some(items) = json.get("items").and_then(|v| v.as_array()) else {
        return outcome;
    };

    for item in items {
        // Each item is a single-key object: {"update": {...}}
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            outcome.failed += 1;
            continue;
        };
        let status = result.get("status").and_then(|s| s.as_u64()).unwrap_or(0);
        match result.get("error") {
            None if (200..300).contains(&status) => outcome.succeeded += 1,
            error => {
                outcome.failed += 1;
                if outcome.first_error.is_none() {
                    outcome.first_error = Some(
                        error
                            .and_then(|e| e.get("reason"))
                            .and_then(|r| r.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("status {}", status)),
                    );
                }
            }
        }
    }

    outcome
}
