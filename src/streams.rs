//! The five synchronized streams and their stage chains.
//!
//! | Stream | Progress key | Index | Chain |
//! |--------|--------------|-------|-------|
//! | [`Stream::FilmWork`] | `film_work` | `movies` | Producer |
//! | [`Stream::FilmWorkPersons`] | `film_work_persons` | `movies` | Producer → Enricher → Merger |
//! | [`Stream::FilmWorkGenres`] | `film_work_genres` | `movies` | Producer → Enricher → Merger |
//! | [`Stream::Persons`] | `persons` | `persons` | Producer |
//! | [`Stream::Genres`] | `genres` | `genres` | Producer |
//!
//! The `Fetch` adapters at the bottom bind one [`RowSource`] query to the
//! window type a stage expects.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{ChangedRow, FilmWork, FilmWorkGenres, FilmWorkPersons, Genre, Person};
use crate::pipeline::{
    BatchStream, CursorWindow, Enricher, Fetch, IdSetWindow, JoinWindow, Merger, Producer,
    Project, Watermark,
};
use crate::progress::ProgressStore;
use crate::queries::Relation;
use crate::source::RowSource;
use crate::sync::{drain, Shutdown, StreamReport, SyncContext};

pub const MOVIES_INDEX: &str = "movies";
pub const PERSONS_INDEX: &str = "persons";
pub const GENRES_INDEX: &str = "genres";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    FilmWork,
    FilmWorkPersons,
    FilmWorkGenres,
    Persons,
    Genres,
}

impl Stream {
    /// Every stream, in pass order.
    pub const ALL: [Stream; 5] = [
        Stream::FilmWork,
        Stream::FilmWorkPersons,
        Stream::FilmWorkGenres,
        Stream::Persons,
        Stream::Genres,
    ];

    /// Progress store key.
    pub fn key(&self) -> &'static str {
        match self {
            Stream::FilmWork => "film_work",
            Stream::FilmWorkPersons => "film_work_persons",
            Stream::FilmWorkGenres => "film_work_genres",
            Stream::Persons => "persons",
            Stream::Genres => "genres",
        }
    }

    /// Target index of the stream's documents.
    pub fn index(&self) -> &'static str {
        match self {
            Stream::FilmWork | Stream::FilmWorkPersons | Stream::FilmWorkGenres => MOVIES_INDEX,
            Stream::Persons => PERSONS_INDEX,
            Stream::Genres => GENRES_INDEX,
        }
    }

    /// Relation whose changes the stream fans out, for patch streams.
    pub fn relation(&self) -> Option<Relation> {
        match self {
            Stream::FilmWorkPersons => Some(Relation::Person),
            Stream::FilmWorkGenres => Some(Relation::Genre),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Stream {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Stream::ALL.iter().find(|stream| stream.key() == s) {
            Some(stream) => Ok(*stream),
            None => {
                let valid: Vec<&str> = Stream::ALL.iter().map(|s| s.key()).collect();
                bail!("Unknown stream: '{}'. Available: {}", s, valid.join(", "))
            }
        }
    }
}

/// Builds the stage chain of `stream` from its persisted watermark and
/// drains it into the sink.
pub async fn run_stream(
    stream: Stream,
    ctx: &SyncContext<'_>,
    progress: &mut ProgressStore,
    shutdown: &Shutdown,
) -> Result<StreamReport> {
    let start = progress.get(stream.key());
    let source = ctx.source;

    match stream {
        Stream::FilmWork => {
            let chain = Producer::new(FilmWorks(source), start, ctx.page_size, FilmWork::watermark)?;
            drain(stream, chain, ctx.sink, progress, shutdown).await
        }
        Stream::FilmWorkPersons => {
            let chain = fan_out(source, Relation::Person, FilmPersons(source), ctx, start)?;
            drain(stream, chain, ctx.sink, progress, shutdown).await
        }
        Stream::FilmWorkGenres => {
            let chain = fan_out(source, Relation::Genre, FilmGenres(source), ctx, start)?;
            drain(stream, chain, ctx.sink, progress, shutdown).await
        }
        Stream::Persons => {
            let chain = Producer::new(Persons(source), start, ctx.page_size, Person::watermark)?;
            drain(stream, chain, ctx.sink, progress, shutdown).await
        }
        Stream::Genres => {
            let chain = Producer::new(Genres(source), start, ctx.page_size, Genre::watermark)?;
            drain(stream, chain, ctx.sink, progress, shutdown).await
        }
    }
}

type FanOut<'a, F> = Merger<
    Project<Enricher<Project<Producer<ChangedRows<'a>>, Uuid>, AffectedFilms<'a>>, Uuid>,
    F,
>;

/// Changed relation rows → affected film ids → patch records.
fn fan_out<'a, F>(
    source: &'a dyn RowSource,
    relation: Relation,
    patch: F,
    ctx: &SyncContext<'_>,
    start: Watermark,
) -> Result<FanOut<'a, F>>
where
    F: Fetch<IdSetWindow>,
{
    let changed = Producer::new(
        ChangedRows { source, relation },
        start,
        ctx.page_size,
        ChangedRow::watermark,
    )?
    .project(ChangedRow::id);
    let films = Enricher::new(changed, AffectedFilms { source, relation }, ctx.page_size)?
        .project(ChangedRow::id);
    Merger::new(films, patch, ctx.set_limit)
}

// ═══════════════════════════════════════════════════════════════════════
// Fetch adapters
// ═══════════════════════════════════════════════════════════════════════

pub struct FilmWorks<'a>(pub &'a dyn RowSource);

#[async_trait]
impl<'a> Fetch<CursorWindow> for FilmWorks<'a> {
    type Row = FilmWork;

    async fn fetch(&self, window: &CursorWindow) -> Result<Vec<FilmWork>> {
        self.0.film_works(window).await
    }
}

pub struct ChangedRows<'a> {
    pub source: &'a dyn RowSource,
    pub relation: Relation,
}

#[async_trait]
impl<'a> Fetch<CursorWindow> for ChangedRows<'a> {
    type Row = ChangedRow;

    async fn fetch(&self, window: &CursorWindow) -> Result<Vec<ChangedRow>> {
        self.source.changed(self.relation, window).await
    }
}

pub struct AffectedFilms<'a> {
    pub source: &'a dyn RowSource,
    pub relation: Relation,
}

#[async_trait]
impl<'a> Fetch<JoinWindow> for AffectedFilms<'a> {
    type Row = ChangedRow;

    async fn fetch(&self, window: &JoinWindow) -> Result<Vec<ChangedRow>> {
        self.source.affected_films(self.relation, window).await
    }
}

pub struct FilmPersons<'a>(pub &'a dyn RowSource);

#[async_trait]
impl<'a> Fetch<IdSetWindow> for FilmPersons<'a> {
    type Row = FilmWorkPersons;

    async fn fetch(&self, window: &IdSetWindow) -> Result<Vec<FilmWorkPersons>> {
        self.0.film_persons(window).await
    }
}

pub struct FilmGenres<'a>(pub &'a dyn RowSource);

#[async_trait]
impl<'a> Fetch<IdSetWindow> for FilmGenres<'a> {
    type Row = FilmWorkGenres;

    async fn fetch(&self, window: &IdSetWindow) -> Result<Vec<FilmWorkGenres>> {
        self.0.film_genres(window).await
    }
}

pub struct Persons<'a>(pub &'a dyn RowSource);

#[async_trait]
impl<'a> Fetch<CursorWindow> for Persons<'a> {
    type Row = Person;

    async fn fetch(&self, window: &CursorWindow) -> Result<Vec<Person>> {
        self.0.persons(window).await
    }
}

pub struct Genres<'a>(pub &'a dyn RowSource);

#[async_trait]
impl<'a> Fetch<CursorWindow> for Genres<'a> {
    type Row = Genre;

    async fn fetch(&self, window: &CursorWindow) -> Result<Vec<Genre>> {
        self.0.genres(window).await
    }
}
