//! Stage 1: keyset cursor walker.
//!
//! Repeats "up to N rows after the cursor, ordered by `(updated_at, id)`"
//! and moves the cursor to the last row of every non-empty page. The walk
//! ends on the first empty page.

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{BatchStream, CursorWindow, Fetch, Watermark};

pub struct Producer<F: Fetch<CursorWindow>> {
    fetch: F,
    cursor_of: fn(&F::Row) -> Watermark,
    window: CursorWindow,
    exhausted: bool,
}

impl<F: Fetch<CursorWindow>> Producer<F> {
    /// `cursor_of` extracts the ordering key of a row; rows returned by
    /// `fetch` must be sorted ascending by it.
    pub fn new(
        fetch: F,
        start: Watermark,
        page_size: i64,
        cursor_of: fn(&F::Row) -> Watermark,
    ) -> Result<Self> {
        if page_size < 1 {
            bail!("cursor walk requires page_size >= 1, got {}", page_size);
        }
        Ok(Self {
            fetch,
            cursor_of,
            window: CursorWindow {
                after: start,
                limit: page_size,
            },
            exhausted: false,
        })
    }
}

#[async_trait]
impl<F: Fetch<CursorWindow>> BatchStream for Producer<F> {
    type Item = F::Row;

    async fn next_batch(&mut self) -> Result<Option<Vec<F::Row>>> {
        if self.exhausted {
            return Ok(None);
        }

        let rows = self.fetch.fetch(&self.window).await?;
        let Some(last) = rows.last() else {
            self.exhausted = true;
            return Ok(None);
        };

        let next = (self.cursor_of)(last);
        if next.key() < self.window.after.key() {
            bail!(
                "cursor moved backwards from {} to {}; rows must be ordered by (updated_at, id)",
                self.window.after,
                next
            );
        }

        self.window = CursorWindow {
            after: next,
            limit: self.window.limit,
        };
        Ok(Some(rows))
    }

    fn watermark(&self) -> Watermark {
        self.window.after
    }
}
