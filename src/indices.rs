//! Search index definitions.
//!
//! All three indices share the `ru_en` analyzer (standard tokenizer,
//! lowercase, English and Russian stop words and stemmers) and use strict
//! mappings, so a document carrying an unknown field is rejected per item
//! by the bulk API instead of silently widening the schema.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use crate::config::ElasticConfig;
use crate::streams::{GENRES_INDEX, MOVIES_INDEX, PERSONS_INDEX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    AlreadyExists,
}

pub fn index_settings() -> Value {
    json!({
        "refresh_interval": "1s",
        "analysis": {
            "filter": {
                "english_stop": { "type": "stop", "stopwords": "_english_" },
                "english_stemmer": { "type": "stemmer", "language": "english" },
                "english_possessive_stemmer": { "type": "stemmer", "language": "possessive_english" },
                "russian_stop": { "type": "stop", "stopwords": "_russian_" },
                "russian_stemmer": { "type": "stemmer", "language": "russian" }
            },
            "analyzer": {
                "ru_en": {
                    "tokenizer": "standard",
                    "filter": [
                        "lowercase",
                        "english_stop",
                        "english_stemmer",
                        "english_possessive_stemmer",
                        "russian_stop",
                        "russian_stemmer"
                    ]
                }
            }
        }
    })
}

fn text() -> Value {
    json!({ "type": "text", "analyzer": "ru_en" })
}

fn nested(name_field: &str) -> Value {
    json!({
        "type": "nested",
        "dynamic": "strict",
        "properties": {
            "uuid": { "type": "keyword" },
            name_field: text()
        }
    })
}

pub fn movies_mappings() -> Value {
    json!({
        "dynamic": "strict",
        "properties": {
            "uuid": { "type": "keyword" },
            "imdb_rating": { "type": "float" },
            "title": {
                "type": "text",
                "analyzer": "ru_en",
                "fields": { "raw": { "type": "keyword" } }
            },
            "description": text(),
            "genre": nested("name"),
            "genres_names": text(),
            "actors": nested("full_name"),
            "actors_names": text(),
            "writers": nested("full_name"),
            "writers_names": text(),
            "directors": nested("full_name"),
            "directors_names": text()
        }
    })
}

pub fn genres_mappings() -> Value {
    json!({
        "dynamic": "strict",
        "properties": {
            "uuid": { "type": "keyword" },
            "name": text()
        }
    })
}

pub fn persons_mappings() -> Value {
    json!({
        "dynamic": "strict",
        "properties": {
            "uuid": { "type": "keyword" },
            "full_name": text(),
            "role": nested("role"),
            "film_ids": { "type": "keyword" }
        }
    })
}

/// `PUT /{index}` body for each index.
pub fn definitions() -> Vec<(&'static str, Value)> {
    [
        (MOVIES_INDEX, movies_mappings()),
        (GENRES_INDEX, genres_mappings()),
        (PERSONS_INDEX, persons_mappings()),
    ]
    .into_iter()
    .map(|(name, mappings)| {
        (
            name,
            json!({ "settings": index_settings(), "mappings": mappings }),
        )
    })
    .collect()
}

/// Creates every index. Indices that already exist are left untouched.
pub async fn create_indices(config: &ElasticConfig) -> Result<Vec<(&'static str, IndexStatus)>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut results = Vec::new();
    for (name, body) in definitions() {
        let resp = client
            .put(format!("{}/{}", config.base_url(), name))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let json: Value = resp.json().await.unwrap_or(Value::Null);
        let outcome = if status.is_success() {
            IndexStatus::Created
        } else if error_type(&json) == Some("resource_already_exists_exception") {
            IndexStatus::AlreadyExists
        } else {
            bail!("Failed to create index '{}': {} {}", name, status, json);
        };

        info!(index = name, status = ?outcome, "index ready");
        results.push((name, outcome));
    }

    Ok(results)
}

fn error_type(json: &Value) -> Option<&str> {
    json.get("error")?.get("type")?.as_str()
}
