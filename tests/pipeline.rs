use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use filmsync::models::ChangedRow;
use filmsync::pipeline::{
    BatchStream, CursorWindow, Enricher, Fetch, IdSetWindow, JoinWindow, Merger, Producer,
    Watermark,
};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
}

fn row(id: u128, secs: i64) -> ChangedRow {
    ChangedRow {
        id: Uuid::from_u128(id),
        updated_at: ts(secs),
    }
}

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

/// Keyset-paged table, recording every window it was queried with.
struct Table {
    rows: Vec<ChangedRow>,
    log: Arc<Mutex<Vec<CursorWindow>>>,
}

impl Table {
    fn new(mut rows: Vec<ChangedRow>) -> (Self, Arc<Mutex<Vec<CursorWindow>>>) {
        rows.sort_by_key(|r| (r.updated_at, r.id));
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                rows,
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl Fetch<CursorWindow> for Table {
    type Row = ChangedRow;

    async fn fetch(&self, window: &CursorWindow) -> Result<Vec<ChangedRow>> {
        self.log.lock().unwrap().push(window.clone());
        Ok(self
            .rows
            .iter()
            .filter(|r| r.watermark().key() > window.after.key())
            .take(window.limit as usize)
            .cloned()
            .collect())
    }
}

/// Join table: relation id → linked film rows, paged with LIMIT/OFFSET.
struct Join {
    links: HashMap<Uuid, Vec<ChangedRow>>,
    log: Arc<Mutex<Vec<JoinWindow>>>,
}

#[async_trait]
impl Fetch<JoinWindow> for Join {
    type Row = ChangedRow;

    async fn fetch(&self, window: &JoinWindow) -> Result<Vec<ChangedRow>> {
        self.log.lock().unwrap().push(window.clone());
        let mut films: Vec<ChangedRow> = window
            .ids
            .iter()
            .flat_map(|id| self.links.get(id).cloned().unwrap_or_default())
            .collect();
        films.sort_by_key(|r| (r.updated_at, r.id));
        films.dedup();
        Ok(films
            .into_iter()
            .skip(window.offset as usize)
            .take(window.limit as usize)
            .collect())
    }
}

/// Id-set query returning the ids it was asked for.
struct IdEcho {
    log: Arc<Mutex<Vec<IdSetWindow>>>,
}

#[async_trait]
impl Fetch<IdSetWindow> for IdEcho {
    type Row = Uuid;

    async fn fetch(&self, window: &IdSetWindow) -> Result<Vec<Uuid>> {
        self.log.lock().unwrap().push(window.clone());
        Ok(window.ids.clone())
    }
}

/// Upstream of canned id batches; the watermark after batch `i` is `ts(i + 1)`.
struct Canned {
    batches: VecDeque<Vec<Uuid>>,
    yielded: i64,
}

impl Canned {
    fn new(batches: Vec<Vec<Uuid>>) -> Self {
        Self {
            batches: batches.into(),
            yielded: 0,
        }
    }
}

#[async_trait]
impl BatchStream for Canned {
    type Item = Uuid;

    async fn next_batch(&mut self) -> Result<Option<Vec<Uuid>>> {
        let batch = self.batches.pop_front();
        if batch.is_some() {
            self.yielded += 1;
        }
        Ok(batch)
    }

    fn watermark(&self) -> Watermark {
        if self.yielded == 0 {
            Watermark::epoch()
        } else {
            Watermark::at(ts(self.yielded))
        }
    }
}

async fn collect<S: BatchStream>(stream: &mut S) -> Vec<Vec<S::Item>> {
    let mut batches = Vec::new();
    while let Some(batch) = stream.next_batch().await.unwrap() {
        batches.push(batch);
    }
    batches
}

// ============ Producer ============

#[tokio::test]
async fn producer_pages_five_rows_as_two_two_one() {
    let rows: Vec<ChangedRow> = (1..=5).map(|n| row(n, n as i64 * 10)).collect();
    let (table, log) = Table::new(rows.clone());
    let mut producer =
        Producer::new(table, Watermark::epoch(), 2, ChangedRow::watermark).unwrap();

    let mut sizes = Vec::new();
    let mut cursors = Vec::new();
    while let Some(batch) = producer.next_batch().await.unwrap() {
        sizes.push(batch.len());
        cursors.push(producer.watermark());
    }

    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(
        cursors,
        vec![rows[1].watermark(), rows[3].watermark(), rows[4].watermark()]
    );
    // Three pages plus the terminating empty one
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn producer_cursor_is_monotonic_across_ties() {
    // Seven rows, four of them sharing one timestamp across page boundaries
    let rows = vec![
        row(1, 10),
        row(2, 20),
        row(3, 20),
        row(4, 20),
        row(5, 20),
        row(6, 30),
        row(7, 30),
    ];
    let (table, _) = Table::new(rows);
    let mut producer =
        Producer::new(table, Watermark::epoch(), 2, ChangedRow::watermark).unwrap();

    let batches = collect(&mut producer).await;
    for pair in batches.windows(2) {
        let last = pair[0].last().unwrap().watermark().key();
        let first = pair[1].first().unwrap().watermark().key();
        assert!(first >= last);
    }

    let ids: Vec<Uuid> = batches.iter().flatten().map(|r| r.id).collect();
    assert_eq!(ids, (1..=7).map(id).collect::<Vec<_>>());
}

#[tokio::test]
async fn producer_stays_exhausted() {
    let (table, log) = Table::new(vec![row(1, 10)]);
    let mut producer =
        Producer::new(table, Watermark::epoch(), 10, ChangedRow::watermark).unwrap();

    assert_eq!(collect(&mut producer).await.len(), 1);
    let queries = log.lock().unwrap().len();
    assert!(producer.next_batch().await.unwrap().is_none());
    assert_eq!(log.lock().unwrap().len(), queries);
}

#[tokio::test]
async fn producer_resumes_after_watermark() {
    let rows: Vec<ChangedRow> = (1..=4).map(|n| row(n, n as i64)).collect();
    let (table, _) = Table::new(rows.clone());
    let mut producer = Producer::new(table, rows[1].watermark(), 10, ChangedRow::watermark).unwrap();

    let batches = collect(&mut producer).await;
    assert_eq!(batches, vec![vec![rows[2].clone(), rows[3].clone()]]);
}

#[tokio::test]
async fn producer_without_new_rows_keeps_watermark() {
    let rows = vec![row(1, 1), row(2, 2)];
    let (table, _) = Table::new(rows.clone());
    let start = rows[1].watermark();
    let mut producer = Producer::new(table, start, 10, ChangedRow::watermark).unwrap();

    assert!(collect(&mut producer).await.is_empty());
    assert_eq!(producer.watermark(), start);
}

// ============ Enricher ============

fn join_fixture() -> (Join, Arc<Mutex<Vec<JoinWindow>>>) {
    let mut links = HashMap::new();
    // Relation 100 fans out to five films, relation 200 to one
    links.insert(id(100), (1..=5).map(|n| row(n, n as i64)).collect());
    links.insert(id(200), vec![row(9, 9)]);
    let log = Arc::new(Mutex::new(Vec::new()));
    (
        Join {
            links,
            log: log.clone(),
        },
        log,
    )
}

#[tokio::test]
async fn enricher_restarts_offset_for_each_upstream_batch() {
    let (join, log) = join_fixture();
    let upstream = Canned::new(vec![vec![id(100)], vec![id(200)]]);
    let mut enricher = Enricher::new(upstream, join, 2).unwrap();

    let batches = collect(&mut enricher).await;
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1, 1]);

    let offsets: Vec<(Uuid, i64)> = log
        .lock()
        .unwrap()
        .iter()
        .map(|w| (w.ids[0], w.offset))
        .collect();
    assert_eq!(
        offsets,
        vec![
            (id(100), 0),
            (id(100), 2),
            (id(100), 4),
            (id(100), 6),
            (id(200), 0),
            (id(200), 2),
        ]
    );
}

#[tokio::test]
async fn enricher_watermark_waits_for_full_expansion() {
    let (join, _) = join_fixture();
    let upstream = Canned::new(vec![vec![id(100)], vec![id(200)]]);
    let mut enricher = Enricher::new(upstream, join, 2).unwrap();

    enricher.next_batch().await.unwrap();
    assert_eq!(enricher.watermark(), Watermark::epoch());
    assert_eq!(enricher.offset(), Some(2));

    enricher.next_batch().await.unwrap();
    enricher.next_batch().await.unwrap();
    // Third page of relation 100 handed on, its expansion not yet seen empty
    assert_eq!(enricher.watermark(), Watermark::epoch());

    // Next pull drains relation 100 and opens relation 200
    enricher.next_batch().await.unwrap();
    assert_eq!(enricher.watermark(), Watermark::at(ts(1)));

    assert!(enricher.next_batch().await.unwrap().is_none());
    assert_eq!(enricher.watermark(), Watermark::at(ts(2)));
}

#[tokio::test]
async fn enricher_skips_batches_without_links() {
    let (join, _) = join_fixture();
    let upstream = Canned::new(vec![vec![id(300)], vec![id(200)]]);
    let mut enricher = Enricher::new(upstream, join, 2).unwrap();

    let batches = collect(&mut enricher).await;
    assert_eq!(batches, vec![vec![row(9, 9)]]);
}

// ============ Merger ============

#[tokio::test]
async fn merger_flushes_once_past_threshold() {
    let (a, b, c, d) = (id(1), id(2), id(3), id(4));
    let log = Arc::new(Mutex::new(Vec::new()));
    let upstream = Canned::new(vec![vec![a, b], vec![b, c], vec![d]]);
    let mut merger = Merger::new(upstream, IdEcho { log: log.clone() }, 3).unwrap();

    let first = merger.next_batch().await.unwrap().unwrap();
    assert_eq!(first, vec![a, b, c, d]);
    assert_eq!(merger.watermark(), Watermark::at(ts(3)));

    assert!(merger.next_batch().await.unwrap().is_none());
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn merger_flushes_remainder_at_end() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let upstream = Canned::new(vec![vec![id(1)], vec![id(1), id(2)]]);
    let mut merger = Merger::new(upstream, IdEcho { log: log.clone() }, 100).unwrap();

    assert_eq!(merger.pending(), 0);
    let batches = collect(&mut merger).await;
    assert_eq!(batches, vec![vec![id(1), id(2)]]);
    assert_eq!(merger.watermark(), Watermark::at(ts(2)));
}

#[tokio::test]
async fn merger_never_drops_ids() {
    let input: Vec<Vec<Uuid>> = vec![
        vec![id(1), id(2), id(3)],
        vec![id(3), id(4)],
        vec![id(5)],
        vec![id(1), id(6), id(7), id(8)],
        vec![id(9)],
        vec![id(2), id(10)],
    ];
    let expected: BTreeSet<Uuid> = input.iter().flatten().copied().collect();

    for limit in 1..=12 {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut merger =
            Merger::new(Canned::new(input.clone()), IdEcho { log: log.clone() }, limit).unwrap();
        let yielded: BTreeSet<Uuid> = collect(&mut merger).await.into_iter().flatten().collect();
        assert_eq!(yielded, expected, "set_limit {}", limit);
    }
}

#[tokio::test]
async fn merger_over_empty_upstream_queries_nothing() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut merger = Merger::new(Canned::new(vec![]), IdEcho { log: log.clone() }, 3).unwrap();
    assert!(merger.next_batch().await.unwrap().is_none());
    assert!(log.lock().unwrap().is_empty());
}

// ============ Composition ============

#[tokio::test]
async fn full_chain_dedups_fan_out() {
    // Two changed relation rows, both linked to overlapping films
    let (table, _) = Table::new(vec![row(100, 1), row(200, 2)]);
    let mut links = HashMap::new();
    links.insert(id(100), vec![row(1, 1), row(2, 2)]);
    links.insert(id(200), vec![row(2, 2), row(3, 3)]);
    let join = Join {
        links,
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let set_log = Arc::new(Mutex::new(Vec::new()));

    let producer = Producer::new(table, Watermark::epoch(), 1, ChangedRow::watermark)
        .unwrap()
        .project(ChangedRow::id);
    let enricher = Enricher::new(producer, join, 10)
        .unwrap()
        .project(ChangedRow::id);
    let mut merger = Merger::new(enricher, IdEcho { log: set_log.clone() }, 100).unwrap();

    let batches = collect(&mut merger).await;
    assert_eq!(batches, vec![vec![id(1), id(2), id(3)]]);
    assert_eq!(merger.watermark(), row(200, 2).watermark());
}

// ============ Configuration errors ============

#[test]
fn zero_sizes_are_rejected() {
    let (table, _) = Table::new(vec![]);
    assert!(Producer::new(table, Watermark::epoch(), 0, ChangedRow::watermark).is_err());

    let (join, _) = join_fixture();
    assert!(Enricher::new(Canned::new(vec![]), join, 0).is_err());

    let echo = IdEcho {
        log: Arc::new(Mutex::new(Vec::new())),
    };
    assert!(Merger::new(Canned::new(vec![]), echo, 0).is_err());
}
