//! Stage 3: set batcher.
//!
//! Many-to-many fan-out hands over the same root id many times in small
//! pages. The merger unions those pages into one set and only queries once
//! the set grows past `set_limit`, then once more for the remainder when the
//! upstream drains. No id is dropped; the threshold only changes batching.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::{BatchStream, Fetch, IdSetWindow, Watermark};

pub const DEFAULT_SET_LIMIT: usize = 100;

pub struct Merger<U, F>
where
    U: BatchStream<Item = Uuid>,
    F: Fetch<IdSetWindow>,
{
    upstream: U,
    fetch: F,
    set_limit: usize,
    ids: BTreeSet<Uuid>,
    /// Upstream watermark at the last flush.
    flushed: Watermark,
    exhausted: bool,
}

impl<U, F> Merger<U, F>
where
    U: BatchStream<Item = Uuid>,
    F: Fetch<IdSetWindow>,
{
    pub fn new(upstream: U, fetch: F, set_limit: usize) -> Result<Self> {
        if set_limit == 0 {
            bail!("set batching requires set_limit >= 1");
        }
        let start = upstream.watermark();
        Ok(Self {
            upstream,
            fetch,
            set_limit,
            ids: BTreeSet::new(),
            flushed: start,
            exhausted: false,
        })
    }

    /// Ids accumulated but not yet flushed.
    pub fn pending(&self) -> usize {
        self.ids.len()
    }

    async fn flush(&mut self) -> Result<Vec<F::Row>> {
        let covered = self.upstream.watermark();
        let window = IdSetWindow {
            ids: std::mem::take(&mut self.ids).into_iter().collect(),
        };
        let rows = self.fetch.fetch(&window).await?;
        self.flushed = covered;
        Ok(rows)
    }
}

#[async_trait]
impl<U, F> BatchStream for Merger<U, F>
where
    U: BatchStream<Item = Uuid>,
    F: Fetch<IdSetWindow>,
{
    type Item = F::Row;

    async fn next_batch(&mut self) -> Result<Option<Vec<F::Row>>> {
        if self.exhausted {
            return Ok(None);
        }

        while let Some(batch) = self.upstream.next_batch().await? {
            self.ids.extend(batch);
            if self.ids.len() > self.set_limit {
                return self.flush().await.map(Some);
            }
        }

        self.exhausted = true;
        if self.ids.is_empty() {
            self.flushed = self.upstream.watermark();
            return Ok(None);
        }
        self.flush().await.map(Some)
    }

    fn watermark(&self) -> Watermark {
        self.flushed
    }
}
