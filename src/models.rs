//! Records read from Postgres and the documents written to and read back
//! from the search index.
//!
//! The write side mirrors the query shapes in [`crate::queries`]; every
//! record implements [`IndexDocument`], which renames the internal `id` to
//! the index's `uuid` field and drops `updated_at`. The read side
//! (`*View` types) deserializes `_source` documents for the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::pipeline::Watermark;

/// A record that can be shipped to the index.
pub trait IndexDocument {
    /// Upsert id of the document.
    fn doc_id(&self) -> Uuid;
    /// Index representation: field renames, internal fields dropped.
    fn to_document(&self) -> Value;
}

// ═══════════════════════════════════════════════════════════════════════
// Write side
// ═══════════════════════════════════════════════════════════════════════

/// `{id, name}` element of a film's genre list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenreRef {
    pub id: Uuid,
    pub name: String,
}

/// `{id, full_name}` element of a film's actor/writer/director lists.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub full_name: String,
}

/// `{film_id, role}` element of a person's filmography.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoleRef {
    pub film_id: Uuid,
    pub role: String,
}

/// Narrow `(id, updated_at)` row used to walk a table or a join.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChangedRow {
    pub id: Uuid,
    pub updated_at: DateTime<Utc>,
}

impl ChangedRow {
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.updated_at, self.id)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Root aggregate: a film with its genres and people.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FilmWork {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub imdb_rating: Option<f64>,
    #[sqlx(json)]
    pub genre: Vec<GenreRef>,
    #[sqlx(json)]
    pub actors: Vec<PersonRef>,
    #[sqlx(json)]
    pub writers: Vec<PersonRef>,
    #[sqlx(json)]
    pub directors: Vec<PersonRef>,
    pub updated_at: DateTime<Utc>,
}

impl FilmWork {
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.updated_at, self.id)
    }
}

impl IndexDocument for FilmWork {
    fn doc_id(&self) -> Uuid {
        self.id
    }

    fn to_document(&self) -> Value {
        json!({
            "uuid": self.id,
            "title": self.title,
            "description": self.description,
            "imdb_rating": self.imdb_rating,
            "genre": genre_docs(&self.genre),
            "genres_names": genre_names(&self.genre),
            "actors": person_docs(&self.actors),
            "actors_names": person_names(&self.actors),
            "writers": person_docs(&self.writers),
            "writers_names": person_names(&self.writers),
            "directors": person_docs(&self.directors),
            "directors_names": person_names(&self.directors),
        })
    }
}

/// Patch: the people fields of a film, recomputed after a person change.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FilmWorkPersons {
    pub id: Uuid,
    #[sqlx(json)]
    pub actors: Vec<PersonRef>,
    #[sqlx(json)]
    pub writers: Vec<PersonRef>,
    #[sqlx(json)]
    pub directors: Vec<PersonRef>,
}

impl IndexDocument for FilmWorkPersons {
    fn doc_id(&self) -> Uuid {
        self.id
    }

    fn to_document(&self) -> Value {
        json!({
            "actors": person_docs(&self.actors),
            "actors_names": person_names(&self.actors),
            "writers": person_docs(&self.writers),
            "writers_names": person_names(&self.writers),
            "directors": person_docs(&self.directors),
            "directors_names": person_names(&self.directors),
        })
    }
}

/// Patch: the genre fields of a film, recomputed after a genre change.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FilmWorkGenres {
    pub id: Uuid,
    #[sqlx(json)]
    pub genre: Vec<GenreRef>,
}

impl IndexDocument for FilmWorkGenres {
    fn doc_id(&self) -> Uuid {
        self.id
    }

    fn to_document(&self) -> Value {
        json!({
            "genre": genre_docs(&self.genre),
            "genres_names": genre_names(&self.genre),
        })
    }
}

/// Person aggregate with the films they took part in.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Person {
    pub id: Uuid,
    pub full_name: String,
    #[sqlx(json)]
    pub roles: Vec<RoleRef>,
    pub film_ids: Vec<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.updated_at, self.id)
    }
}

impl IndexDocument for Person {
    fn doc_id(&self) -> Uuid {
        self.id
    }

    fn to_document(&self) -> Value {
        let roles: Vec<Value> = self
            .roles
            .iter()
            .map(|r| json!({ "uuid": r.film_id, "role": r.role }))
            .collect();
        json!({
            "uuid": self.id,
            "full_name": self.full_name,
            "role": roles,
            "film_ids": self.film_ids,
        })
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Genre {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

impl Genre {
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.updated_at, self.id)
    }
}

impl IndexDocument for Genre {
    fn doc_id(&self) -> Uuid {
        self.id
    }

    fn to_document(&self) -> Value {
        json!({ "uuid": self.id, "name": self.name })
    }
}

fn genre_docs(genres: &[GenreRef]) -> Vec<Value> {
    genres
        .iter()
        .map(|g| json!({ "uuid": g.id, "name": g.name }))
        .collect()
}

fn genre_names(genres: &[GenreRef]) -> Vec<&str> {
    genres.iter().map(|g| g.name.as_str()).collect()
}

fn person_docs(people: &[PersonRef]) -> Vec<Value> {
    people
        .iter()
        .map(|p| json!({ "uuid": p.id, "full_name": p.full_name }))
        .collect()
}

fn person_names(people: &[PersonRef]) -> Vec<&str> {
    people.iter().map(|p| p.full_name.as_str()).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Read side
// ═══════════════════════════════════════════════════════════════════════

/// Film as listed by the listing and search endpoints.
///
/// `title` is optional because a film first created by a people/genre patch
/// has no title until its own row is synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmShort {
    pub uuid: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub imdb_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonShort {
    pub uuid: Uuid,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmDetail {
    pub uuid: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub imdb_rating: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub genre: Vec<GenreView>,
    #[serde(default)]
    pub actors: Vec<PersonShort>,
    #[serde(default)]
    pub writers: Vec<PersonShort>,
    #[serde(default)]
    pub directors: Vec<PersonShort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreView {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleView {
    pub uuid: Uuid,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonView {
    pub uuid: Uuid,
    pub full_name: String,
    #[serde(default)]
    pub role: Vec<RoleView>,
    #[serde(default)]
    pub film_ids: Vec<Uuid>,
}
