//! Sync orchestration.
//!
//! A pass runs every stream one after another. For each stream the chain
//! is rebuilt from its persisted watermark and drained; after every batch
//! the sink accepted, the chain's watermark is written to the progress
//! store, so a crash resumes after the last shipped batch. A stream that
//! fails is logged and skipped; the rest of the pass still runs and the
//! failed stream retries its window on the next pass.
//!
//! `run_forever` repeats passes with `sync.interval_secs` between them until
//! the shutdown signal fires. The signal is checked after each shipped batch
//! and between passes, never in the middle of a batch.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::models::IndexDocument;
use crate::pipeline::{BatchStream, Watermark};
use crate::progress::ProgressStore;
use crate::sink::{prepare_bulk, BulkSink, ElasticSink};
use crate::source::{PgSource, RowSource};
use crate::streams::{run_stream, Stream};

/// Collaborators shared by every stream of a pass.
pub struct SyncContext<'a> {
    pub source: &'a dyn RowSource,
    pub sink: &'a dyn BulkSink,
    pub page_size: i64,
    pub set_limit: usize,
}

/// Outcome of draining one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub stream: Stream,
    pub batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub start: Watermark,
    pub end: Watermark,
    /// Stopped early on shutdown.
    pub interrupted: bool,
    pub error: Option<String>,
}

impl StreamReport {
    fn new(stream: Stream, start: Watermark) -> Self {
        Self {
            stream,
            batches: 0,
            succeeded: 0,
            failed: 0,
            start,
            end: start,
            interrupted: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub streams: Vec<StreamReport>,
}

impl PassReport {
    pub fn stream(&self, stream: Stream) -> Option<&StreamReport> {
        self.streams.iter().find(|r| r.stream == stream)
    }

    pub fn failed_streams(&self) -> Vec<Stream> {
        self.streams
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.stream)
            .collect()
    }

    pub fn batches(&self) -> usize {
        self.streams.iter().map(|r| r.batches).sum()
    }
}

/// Receiving half of the stop signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending half of the stop signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            // Sender gone without firing
            std::future::pending::<()>().await;
        }
    }
}

/// Ships every batch of `chain` to `stream`'s index, persisting the chain's
/// watermark after each accepted batch.
pub async fn drain<S>(
    stream: Stream,
    mut chain: S,
    sink: &dyn BulkSink,
    progress: &mut ProgressStore,
    shutdown: &Shutdown,
) -> Result<StreamReport>
where
    S: BatchStream,
    S::Item: IndexDocument,
{
    let key = stream.key();
    let mut report = StreamReport::new(stream, progress.get(key));

    while let Some(batch) = chain.next_batch().await? {
        let docs = prepare_bulk(&batch);
        let outcome = sink.bulk_upsert(stream.index(), &docs).await?;

        report.batches += 1;
        report.succeeded += outcome.succeeded;
        report.failed += outcome.failed;
        if outcome.failed > 0 {
            warn!(
                stream = key,
                batch = report.batches,
                failed = outcome.failed,
                reason = outcome.first_error.as_deref().unwrap_or("unknown"),
                "documents rejected by index"
            );
        }

        advance(progress, key, chain.watermark(), &mut report)?;
        info!(
            stream = key,
            batch = report.batches,
            succeeded = outcome.succeeded,
            watermark = %report.end,
            "batch shipped"
        );

        if shutdown.is_requested() {
            report.interrupted = true;
            return Ok(report);
        }
    }

    // Tail of the chain that produced no batch (e.g. relation rows with no films)
    advance(progress, key, chain.watermark(), &mut report)?;
    Ok(report)
}

/// Persists `watermark` if it moves the stream forward.
fn advance(
    progress: &mut ProgressStore,
    key: &str,
    watermark: Watermark,
    report: &mut StreamReport,
) -> Result<()> {
    if watermark.key() > progress.get(key).key() {
        progress.set(key, watermark)?;
        report.end = watermark;
    }
    Ok(())
}

/// Runs `streams` once, in order. Stream failures are logged and reported,
/// never propagated.
pub async fn run_pass(
    ctx: &SyncContext<'_>,
    progress: &mut ProgressStore,
    streams: &[Stream],
    shutdown: &Shutdown,
) -> PassReport {
    let mut pass = PassReport::default();

    for &stream in streams {
        if shutdown.is_requested() {
            break;
        }

        let report = match run_stream(stream, ctx, progress, shutdown).await {
            Ok(report) => {
                info!(
                    stream = %stream,
                    batches = report.batches,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    watermark = %report.end,
                    "stream drained"
                );
                report
            }
            Err(e) => {
                error!(stream = %stream, error = %format!("{:#}", e), "stream failed, watermark kept");
                let mut report = StreamReport::new(stream, progress.get(stream.key()));
                report.error = Some(format!("{:#}", e));
                report
            }
        };
        pass.streams.push(report);
    }

    pass
}

/// Repeats passes until `shutdown` fires.
pub async fn run_forever(
    ctx: &SyncContext<'_>,
    progress: &mut ProgressStore,
    streams: &[Stream],
    interval: std::time::Duration,
    mut shutdown: Shutdown,
) {
    loop {
        let pass = run_pass(ctx, progress, streams, &shutdown).await;
        info!(
            batches = pass.batches(),
            failed_streams = pass.failed_streams().len(),
            "pass complete, next in {:?}",
            interval
        );

        if shutdown.is_requested() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.requested() => break,
        }
    }
    info!("sync stopped");
}

/// Entry point of `filmsync sync`.
pub async fn run_sync(
    config: &Config,
    once: bool,
    only: Option<Stream>,
    shutdown: Shutdown,
) -> Result<()> {
    let pool = db::connect(&config.postgres).await?;
    let source = PgSource::new(pool, &config.postgres);
    source.ping().await?;
    let sink = ElasticSink::new(&config.elastic)?;
    let mut progress = ProgressStore::open(&config.sync.state_path);

    let ctx = SyncContext {
        source: &source,
        sink: &sink,
        page_size: config.sync.page_size,
        set_limit: config.sync.set_limit,
    };
    let streams: Vec<Stream> = match only {
        Some(stream) => vec![stream],
        None => Stream::ALL.to_vec(),
    };

    info!(
        streams = streams.len(),
        state = %config.sync.state_path.display(),
        "sync starting"
    );

    if once {
        let pass = run_pass(&ctx, &mut progress, &streams, &shutdown).await;
        let failed = pass.failed_streams();
        if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(|s| s.key()).collect();
            anyhow::bail!("Streams failed: {}", names.join(", "));
        }
    } else {
        run_forever(&ctx, &mut progress, &streams, config.sync.interval(), shutdown).await;
    }

    source.pool().close().await;
    Ok(())
}
