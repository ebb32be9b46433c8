//! Relational row source.
//!
//! [`RowSource`] is the query capability the streams are built on; every
//! method runs one of the shapes in [`crate::queries`] for one window.
//! [`PgSource`] implements it over a shared `PgPool` and retries transient
//! connectivity errors with exponential backoff, so stages above it never
//! see a dropped connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PostgresConfig;
use crate::models::{ChangedRow, FilmWork, FilmWorkGenres, FilmWorkPersons, Genre, Person};
use crate::pipeline::{CursorWindow, IdSetWindow, JoinWindow};
use crate::queries::{self, Relation};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[async_trait]
pub trait RowSource: Send + Sync {
    async fn film_works(&self, window: &CursorWindow) -> Result<Vec<FilmWork>>;

    async fn changed(&self, relation: Relation, window: &CursorWindow) -> Result<Vec<ChangedRow>>;

    async fn affected_films(
        &self,
        relation: Relation,
        window: &JoinWindow,
    ) -> Result<Vec<ChangedRow>>;

    async fn film_persons(&self, window: &IdSetWindow) -> Result<Vec<FilmWorkPersons>>;

    async fn film_genres(&self, window: &IdSetWindow) -> Result<Vec<FilmWorkGenres>>;

    async fn persons(&self, window: &CursorWindow) -> Result<Vec<Person>>;

    async fn genres(&self, window: &CursorWindow) -> Result<Vec<Genre>>;
}

pub struct PgSource {
    pool: PgPool,
    retry_delay: Duration,
    max_retries: Option<u32>,
}

impl PgSource {
    pub fn new(pool: PgPool, config: &PostgresConfig) -> Self {
        Self {
            pool,
            retry_delay: config.retry_delay(),
            max_retries: config.max_retries,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trips a trivial query, without retry.
    pub async fn ping(&self) -> Result<()> {
        self.fetch_once("ping", || sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map(|_| ())
    }

    /// Runs `query` a single time.
    pub async fn fetch_once<T, F, Fut>(&self, label: &str, query: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        query()
            .await
            .with_context(|| format!("Query '{}' failed", label))
    }

    /// Runs `query` until it succeeds or fails with a non-transient error.
    ///
    /// Transient errors are retried forever unless `max_retries` is set, in
    /// which case at most `1 + max_retries` attempts are made.
    pub async fn fetch<T, F, Fut>(&self, label: &str, query: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        let mut delay = self.retry_delay;
        let mut failures: u32 = 0;

        loop {
            match query().await {
                Ok(rows) => {
                    if failures > 0 {
                        debug!(query = label, failures, "query recovered");
                    }
                    return Ok(rows);
                }
                Err(e) if is_transient(&e) => {
                    failures += 1;
                    if let Some(max) = self.max_retries {
                        if failures > max {
                            return Err(e).with_context(|| {
                                format!("Query '{}' failed after {} attempts", label, failures)
                            });
                        }
                    }
                    warn!(
                        query = label,
                        attempt = failures,
                        error = %e,
                        "postgres connection lost, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Query '{}' failed", label));
                }
            }
        }
    }
}

/// Connectivity failures that a fresh connection may fix.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => true,
        // 08xxx: connection exception, 57P01: admin shutdown
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code == "57P01")
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl RowSource for PgSource {
    async fn film_works(&self, window: &CursorWindow) -> Result<Vec<FilmWork>> {
        self.fetch("film_works", || {
            sqlx::query_as::<_, FilmWork>(queries::FILM_WORKS)
                .bind(window.after.updated_at)
                .bind(window.after.id_bound())
                .bind(window.limit)
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn changed(&self, relation: Relation, window: &CursorWindow) -> Result<Vec<ChangedRow>> {
        self.fetch(relation.table(), || {
            sqlx::query_as::<_, ChangedRow>(relation.changed_rows())
                .bind(window.after.updated_at)
                .bind(window.after.id_bound())
                .bind(window.limit)
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn affected_films(
        &self,
        relation: Relation,
        window: &JoinWindow,
    ) -> Result<Vec<ChangedRow>> {
        self.fetch(relation.join_table(), || {
            sqlx::query_as::<_, ChangedRow>(relation.affected_films())
                .bind(window.ids.as_slice())
                .bind(window.limit)
                .bind(window.offset)
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn film_persons(&self, window: &IdSetWindow) -> Result<Vec<FilmWorkPersons>> {
        self.fetch("film_persons", || {
            sqlx::query_as::<_, FilmWorkPersons>(queries::FILM_PERSONS)
                .bind(window.ids.as_slice())
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn film_genres(&self, window: &IdSetWindow) -> Result<Vec<FilmWorkGenres>> {
        self.fetch("film_genres", || {
            sqlx::query_as::<_, FilmWorkGenres>(queries::FILM_GENRES)
                .bind(window.ids.as_slice())
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn persons(&self, window: &CursorWindow) -> Result<Vec<Person>> {
        self.fetch("persons", || {
            sqlx::query_as::<_, Person>(queries::PERSONS)
                .bind(window.after.updated_at)
                .bind(window.after.id_bound())
                .bind(window.limit)
                .fetch_all(&self.pool)
        })
        .await
    }

    async fn genres(&self, window: &CursorWindow) -> Result<Vec<Genre>> {
        self.fetch("genres", || {
            sqlx::query_as::<_, Genre>(queries::GENRES)
                .bind(window.after.updated_at)
                .bind(window.after.id_bound())
                .bind(window.limit)
                .fetch_all(&self.pool)
        })
        .await
    }
}
