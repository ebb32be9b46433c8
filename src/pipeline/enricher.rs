//! Stage 2: join expander.
//!
//! For each upstream batch of ids, pages through the join query with
//! `LIMIT/OFFSET` until a page comes back empty. Every upstream batch starts
//! its own pagination at offset 0, since its join result set is unrelated to
//! the previous one.

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::{BatchStream, Fetch, JoinWindow, Watermark};

pub struct Enricher<U, F>
where
    U: BatchStream<Item = Uuid>,
    F: Fetch<JoinWindow>,
{
    upstream: U,
    fetch: F,
    page_size: i64,
    /// Window of the upstream batch being expanded, positioned at its next page.
    current: Option<JoinWindow>,
    /// Upstream watermark covering `current`.
    pending: Watermark,
    /// Upstream watermark of the last batch whose expansion ran dry.
    completed: Watermark,
    exhausted: bool,
}

impl<U, F> Enricher<U, F>
where
    U: BatchStream<Item = Uuid>,
    F: Fetch<JoinWindow>,
{
    pub fn new(upstream: U, fetch: F, page_size: i64) -> Result<Self> {
        // The offset advances by page_size; zero would request the same page forever.
        if page_size < 1 {
            bail!("join expansion requires page_size >= 1, got {}", page_size);
        }
        let start = upstream.watermark();
        Ok(Self {
            upstream,
            fetch,
            page_size,
            current: None,
            pending: start,
            completed: start,
            exhausted: false,
        })
    }

    /// Offset the next join query will use, if an upstream batch is open.
    pub fn offset(&self) -> Option<i64> {
        self.current.as_ref().map(|w| w.offset)
    }
}

#[async_trait]
impl<U, F> BatchStream for Enricher<U, F>
where
    U: BatchStream<Item = Uuid>,
    F: Fetch<JoinWindow>,
{
    type Item = F::Row;

    async fn next_batch(&mut self) -> Result<Option<Vec<F::Row>>> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let window = match self.current.take() {
                Some(window) => window,
                None => match self.upstream.next_batch().await? {
                    Some(ids) => {
                        self.pending = self.upstream.watermark();
                        JoinWindow {
                            ids,
                            limit: self.page_size,
                            offset: 0,
                        }
                    }
                    None => {
                        self.completed = self.upstream.watermark();
                        self.exhausted = true;
                        return Ok(None);
                    }
                },
            };

            let rows = self.fetch.fetch(&window).await?;
            if rows.is_empty() {
                self.completed = self.pending;
                continue;
            }

            self.current = Some(JoinWindow {
                offset: window.offset + window.limit,
                ..window
            });
            return Ok(Some(rows));
        }
    }

    fn watermark(&self) -> Watermark {
        self.completed
    }
}
