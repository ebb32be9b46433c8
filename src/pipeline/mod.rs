//! Incremental extraction pipeline.
//!
//! Three stages turn "rows changed since the last pass" into batches of
//! index documents. Each stage is a pull-driven [`BatchStream`]: it issues a
//! query only when its consumer asks for the next batch, and stages compose
//! by wrapping one another.
//!
//! ```text
//! ┌────────────┐  ids  ┌────────────┐  ids  ┌────────────┐  records
//! │  Producer  │──────▶│  Enricher  │──────▶│   Merger   │──────────▶ sink
//! │ keyset on  │       │ OFFSET over│       │ dedup set, │
//! │ updated_at │       │ join table │       │ IN-batch   │
//! └────────────┘       └────────────┘       └────────────┘
//! ```
//!
//! | Stage | Module | Query window |
//! |-------|--------|--------------|
//! | cursor walker | [`producer`] | [`CursorWindow`] |
//! | join expander | [`enricher`] | [`JoinWindow`] |
//! | set batcher | [`merger`] | [`IdSetWindow`] |
//!
//! A stream is finite and not restartable: once `next_batch` returned
//! `Ok(None)` the stage stays exhausted. Every stage reports the
//! [`Watermark`] up to which all upstream rows have been fully handed on, so
//! the orchestrator can persist it after shipping a batch.

pub mod enricher;
pub mod merger;
pub mod producer;

pub use enricher::Enricher;
pub use merger::Merger;
pub use producer::Producer;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Resume position of a cursor walk: the `(updated_at, id)` key of the last
/// row handed on.
///
/// `id` breaks ties between rows sharing a timestamp. A watermark without an
/// id (the epoch default, or a timestamp-only persisted value) resumes
/// strictly after `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub updated_at: DateTime<Utc>,
    pub id: Option<Uuid>,
}

impl Watermark {
    pub fn new(updated_at: DateTime<Utc>, id: Uuid) -> Self {
        Self {
            updated_at,
            id: Some(id),
        }
    }

    /// Watermark that only bounds by timestamp.
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            id: None,
        }
    }

    /// 1970-01-01T00:00:00Z, the lower bound of a stream that never ran.
    pub fn epoch() -> Self {
        Self::at(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Id half of the keyset bound. Without a tie-break id this is the
    /// largest UUID, so `(updated_at, id) > (ts, bound)` means `updated_at > ts`.
    pub fn id_bound(&self) -> Uuid {
        self.id.unwrap_or(Uuid::from_u128(u128::MAX))
    }

    /// Keyset comparison key.
    pub fn key(&self) -> (DateTime<Utc>, Uuid) {
        (self.updated_at, self.id_bound())
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::epoch()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} ({})", self.updated_at.to_rfc3339(), id),
            None => write!(f, "{}", self.updated_at.to_rfc3339()),
        }
    }
}

/// Stage-1 query input: up to `limit` rows strictly after `after`, ordered
/// by `(updated_at, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorWindow {
    pub after: Watermark,
    pub limit: i64,
}

/// Stage-2 query input: one page of the join fan-out of `ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinWindow {
    pub ids: Vec<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

/// Stage-3 query input: the accumulated identifier set.
#[derive(Debug, Clone, PartialEq)]
pub struct IdSetWindow {
    pub ids: Vec<Uuid>,
}

/// Executes one query shape for a given window.
///
/// This is the row-fetch capability handed to a stage at construction.
#[async_trait]
pub trait Fetch<W: Send + Sync>: Send + Sync {
    type Row: Send;

    async fn fetch(&self, window: &W) -> Result<Vec<Self::Row>>;
}

/// A lazy, finite, non-restartable sequence of batches.
#[async_trait]
pub trait BatchStream: Send {
    type Item: Send;

    /// Pull the next batch. `Ok(None)` means the stream is drained.
    async fn next_batch(&mut self) -> Result<Option<Vec<Self::Item>>>;

    /// Watermark covering every row already handed on downstream.
    fn watermark(&self) -> Watermark;

    /// Yield one field of each item instead of the whole item.
    fn project<T: Send>(self, field: fn(&Self::Item) -> T) -> Project<Self, T>
    where
        Self: Sized,
    {
        Project { inner: self, field }
    }
}

/// Single-field projection over another stream. See [`BatchStream::project`].
pub struct Project<S: BatchStream, T> {
    inner: S,
    field: fn(&S::Item) -> T,
}

#[async_trait]
impl<S, T> BatchStream for Project<S, T>
where
    S: BatchStream,
    T: Send,
{
    type Item = T;

    async fn next_batch(&mut self) -> Result<Option<Vec<T>>> {
        let field = self.field;
        Ok(self
            .inner
            .next_batch()
            .await?
            .map(|batch| batch.iter().map(field).collect()))
    }

    fn watermark(&self) -> Watermark {
        self.inner.watermark()
    }
}
