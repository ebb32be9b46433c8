//! Catalog queries behind the read API.
//!
//! Every lookup goes cache first. On a miss the search engine is queried
//! and a non-empty result is written back with the configured TTL. Cache
//! failures are logged and treated as misses; the API keeps answering from
//! the index while the cache is down.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{cache_key, ReadCache};
use crate::models::{FilmDetail, FilmShort, GenreView, PersonView};
use crate::search::SearchEngine;
use crate::streams::{GENRES_INDEX, MOVIES_INDEX, PERSONS_INDEX};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;
/// Upper bound of genres and per-person films returned in one response.
const LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub size: u32,
    pub number: u32,
}

impl Page {
    pub fn new(size: Option<u32>, number: Option<u32>) -> Result<Self> {
        let size = size.unwrap_or(DEFAULT_PAGE_SIZE);
        let number = number.unwrap_or(1);
        if size == 0 || size > MAX_PAGE_SIZE {
            bail!("page[size] must be between 1 and {}", MAX_PAGE_SIZE);
        }
        if number == 0 {
            bail!("page[number] must be >= 1");
        }
        Ok(Self { size, number })
    }

    pub fn from(&self) -> u64 {
        (self.number as u64 - 1) * self.size as u64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            size: DEFAULT_PAGE_SIZE,
            number: 1,
        }
    }
}

/// Listing order: `imdb_rating` or `title.raw`, `-` prefix for descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilmSort {
    pub field: &'static str,
    pub descending: bool,
}

impl FilmSort {
    pub fn parse(raw: &str) -> Result<Self> {
        let (descending, name) = match raw.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, raw),
        };
        let field = match name {
            "imdb_rating" => "imdb_rating",
            "title" | "title.raw" => "title.raw",
            _ => bail!("sort must be one of imdb_rating, title.raw (optionally prefixed with '-')"),
        };
        Ok(Self { field, descending })
    }

    pub fn order(&self) -> &'static str {
        if self.descending {
            "desc"
        } else {
            "asc"
        }
    }
}

impl Default for FilmSort {
    fn default() -> Self {
        Self {
            field: "imdb_rating",
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilmListing {
    pub sort: FilmSort,
    pub page: Page,
    pub genre: Option<String>,
}

pub fn film_listing_body(listing: &FilmListing) -> Value {
    let mut body = json!({
        "size": listing.page.size,
        "from": listing.page.from(),
        "sort": [{ listing.sort.field: { "order": listing.sort.order() } }]
    });
    if let Some(genre) = &listing.genre {
        body["query"] = json!({
            "bool": {
                "filter": {
                    "nested": {
                        "path": "genre",
                        "query": { "bool": { "must": { "match": { "genre.name": genre } } } }
                    }
                }
            }
        });
    }
    body
}

pub fn film_search_body(query: &str, page: Page) -> Value {
    json!({
        "size": page.size,
        "from": page.from(),
        "query": {
            "simple_query_string": {
                "query": query,
                "fields": ["title^3", "description"],
                "default_operator": "or"
            }
        }
    })
}

pub fn person_search_body(query: &str, page: Page) -> Value {
    json!({
        "size": page.size,
        "from": page.from(),
        "query": {
            "match": { "full_name": { "query": query, "fuzziness": "auto" } }
        }
    })
}

pub fn films_by_person_body(person_id: Uuid) -> Value {
    let role = |path: &str| {
        json!({
            "nested": {
                "path": path,
                "query": { "bool": { "filter": [{ "term": { format!("{}.uuid", path): person_id } }] } }
            }
        })
    };
    json!({
        "size": LIST_LIMIT,
        "query": { "bool": { "should": [role("actors"), role("writers"), role("directors")] } }
    })
}

pub fn all_genres_body() -> Value {
    json!({ "size": LIST_LIMIT, "query": { "match_all": {} } })
}

pub struct Catalog {
    engine: Arc<dyn SearchEngine>,
    cache: Arc<dyn ReadCache>,
    ttl: Duration,
}

impl Catalog {
    pub fn new(engine: Arc<dyn SearchEngine>, cache: Arc<dyn ReadCache>, ttl: Duration) -> Self {
        Self { engine, cache, ttl }
    }

    pub async fn film(&self, id: Uuid) -> Result<Option<FilmDetail>> {
        self.by_id(MOVIES_INDEX, id).await
    }

    pub async fn films(&self, listing: &FilmListing) -> Result<Vec<FilmShort>> {
        let key = cache_key(
            MOVIES_INDEX,
            &[
                ("method", "films".to_string()),
                ("sort_by", listing.sort.field.to_string()),
                ("order", listing.sort.order().to_string()),
                ("page_size", listing.page.size.to_string()),
                ("page_number", listing.page.number.to_string()),
                ("filter_by", listing.genre.clone().unwrap_or_default()),
            ],
        );
        self.search(MOVIES_INDEX, film_listing_body(listing), &key)
            .await
    }

    pub async fn search_films(&self, query: &str, page: Page) -> Result<Vec<FilmShort>> {
        let key = cache_key(
            MOVIES_INDEX,
            &[
                ("method", "films_search".to_string()),
                ("query", query.to_string()),
                ("page_size", page.size.to_string()),
                ("page_number", page.number.to_string()),
            ],
        );
        self.search(MOVIES_INDEX, film_search_body(query, page), &key)
            .await
    }

    pub async fn genres(&self) -> Result<Vec<GenreView>> {
        let key = cache_key(GENRES_INDEX, &[("method", "all_genres".to_string())]);
        self.search(GENRES_INDEX, all_genres_body(), &key).await
    }

    pub async fn genre(&self, id: Uuid) -> Result<Option<GenreView>> {
        self.by_id(GENRES_INDEX, id).await
    }

    pub async fn person(&self, id: Uuid) -> Result<Option<PersonView>> {
        self.by_id(PERSONS_INDEX, id).await
    }

    pub async fn search_persons(&self, query: &str, page: Page) -> Result<Vec<PersonView>> {
        let key = cache_key(
            PERSONS_INDEX,
            &[
                ("method", "person_search".to_string()),
                ("query", query.to_string()),
                ("page_size", page.size.to_string()),
                ("page_number", page.number.to_string()),
            ],
        );
        self.search(PERSONS_INDEX, person_search_body(query, page), &key)
            .await
    }

    pub async fn films_by_person(&self, person_id: Uuid) -> Result<Vec<FilmShort>> {
        let key = cache_key(
            PERSONS_INDEX,
            &[
                ("method", "films_by_person".to_string()),
                ("person_id", person_id.to_string()),
            ],
        );
        self.search(MOVIES_INDEX, films_by_person_body(person_id), &key)
            .await
    }

    async fn by_id<T>(&self, index: &str, id: Uuid) -> Result<Option<T>>
    where
        T: DeserializeOwned + Serialize,
    {
        let key = cache_key(index, &[("by_id", id.to_string())]);
        if let Some(hit) = self.cached(&key).await {
            return Ok(Some(hit));
        }

        let Some(source) = self.engine.get(index, &id.to_string()).await? else {
            return Ok(None);
        };
        let value: T = serde_json::from_value(source)?;
        self.store(&key, &value).await;
        Ok(Some(value))
    }

    async fn search<T>(&self, index: &str, body: Value, key: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Serialize,
    {
        if let Some(hit) = self.cached(key).await {
            return Ok(hit);
        }

        let items = self
            .engine
            .search(index, &body)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        if !items.is_empty() {
            self.store(key, &items).await;
        }
        Ok(items)
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.read(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    async fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.cache.write(key, &raw, self.ttl).await {
            warn!(key, error = %e, "cache write failed");
        }
    }
}
