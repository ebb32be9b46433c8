//! SQL text for every query shape the pipeline runs.
//!
//! Keyset queries bind `$1` = watermark timestamp, `$2` = tie-break id and
//! `$3` = page size. Id-set and join queries bind a `uuid[]` and compare
//! with `= ANY(..)`, the Postgres form of an `IN` list.
//!
//! Aggregated lists are `COALESCE`d to empty JSON arrays so that a film
//! without genres or people decodes to `vec![]` rather than `NULL`.

/// Many-to-many relation of `content.film_work` that can trigger patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Person,
    Genre,
}

impl Relation {
    pub fn table(&self) -> &'static str {
        match self {
            Relation::Person => "content.person",
            Relation::Genre => "content.genre",
        }
    }

    pub fn join_table(&self) -> &'static str {
        match self {
            Relation::Person => "content.person_film_work",
            Relation::Genre => "content.genre_film_work",
        }
    }

    /// Walks `(id, updated_at)` of the relation table past a watermark.
    pub fn changed_rows(&self) -> &'static str {
        match self {
            Relation::Person => PERSON_CHANGES,
            Relation::Genre => GENRE_CHANGES,
        }
    }

    /// Pages through the films linked to a set of relation ids.
    pub fn affected_films(&self) -> &'static str {
        match self {
            Relation::Person => FILMS_BY_PERSONS,
            Relation::Genre => FILMS_BY_GENRES,
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Root aggregate: films changed since the watermark with nested genres and people.
pub const FILM_WORKS: &str = r#"
SELECT
    fw.id,
    fw.title,
    fw.description,
    fw.rating::float8 AS imdb_rating,
    fw.updated_at,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', g.id, 'name', g.name))
            FILTER (WHERE g.id IS NOT NULL),
        '[]'
    ) AS genre,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', p.id, 'full_name', p.full_name))
            FILTER (WHERE pfw.role = 'actor'),
        '[]'
    ) AS actors,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', p.id, 'full_name', p.full_name))
            FILTER (WHERE pfw.role = 'writer'),
        '[]'
    ) AS writers,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', p.id, 'full_name', p.full_name))
            FILTER (WHERE pfw.role = 'director'),
        '[]'
    ) AS directors
FROM content.film_work fw
LEFT JOIN content.person_film_work pfw ON pfw.film_work_id = fw.id
LEFT JOIN content.person p ON p.id = pfw.person_id
LEFT JOIN content.genre_film_work gfw ON gfw.film_work_id = fw.id
LEFT JOIN content.genre g ON g.id = gfw.genre_id
WHERE (fw.updated_at, fw.id) > ($1, $2)
GROUP BY fw.id
ORDER BY fw.updated_at, fw.id
LIMIT $3
"#;

const PERSON_CHANGES: &str = r#"
SELECT id, updated_at
FROM content.person
WHERE (updated_at, id) > ($1, $2)
ORDER BY updated_at, id
LIMIT $3
"#;

const GENRE_CHANGES: &str = r#"
SELECT id, updated_at
FROM content.genre
WHERE (updated_at, id) > ($1, $2)
ORDER BY updated_at, id
LIMIT $3
"#;

const FILMS_BY_PERSONS: &str = r#"
SELECT DISTINCT fw.id, fw.updated_at
FROM content.film_work fw
JOIN content.person_film_work rfw ON rfw.film_work_id = fw.id
WHERE rfw.person_id = ANY($1)
ORDER BY fw.updated_at, fw.id
LIMIT $2
OFFSET $3
"#;

const FILMS_BY_GENRES: &str = r#"
SELECT DISTINCT fw.id, fw.updated_at
FROM content.film_work fw
JOIN content.genre_film_work rfw ON rfw.film_work_id = fw.id
WHERE rfw.genre_id = ANY($1)
ORDER BY fw.updated_at, fw.id
LIMIT $2
OFFSET $3
"#;

/// Person-derived patch: the three people lists of each film in the set.
pub const FILM_PERSONS: &str = r#"
SELECT
    fw.id,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', p.id, 'full_name', p.full_name))
            FILTER (WHERE pfw.role = 'actor'),
        '[]'
    ) AS actors,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', p.id, 'full_name', p.full_name))
            FILTER (WHERE pfw.role = 'writer'),
        '[]'
    ) AS writers,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', p.id, 'full_name', p.full_name))
            FILTER (WHERE pfw.role = 'director'),
        '[]'
    ) AS directors
FROM content.film_work fw
LEFT JOIN content.person_film_work pfw ON pfw.film_work_id = fw.id
LEFT JOIN content.person p ON p.id = pfw.person_id
WHERE fw.id = ANY($1)
GROUP BY fw.id
"#;

/// Genre-derived patch: the genre list of each film in the set.
pub const FILM_GENRES: &str = r#"
SELECT
    fw.id,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('id', g.id, 'name', g.name))
            FILTER (WHERE g.id IS NOT NULL),
        '[]'
    ) AS genre
FROM content.film_work fw
LEFT JOIN content.genre_film_work gfw ON gfw.film_work_id = fw.id
LEFT JOIN content.genre g ON g.id = gfw.genre_id
WHERE fw.id = ANY($1)
GROUP BY fw.id
"#;

/// Person aggregate with roles and film ids.
pub const PERSONS: &str = r#"
SELECT
    p.id,
    p.full_name,
    p.updated_at,
    COALESCE(
        JSON_AGG(DISTINCT jsonb_build_object('film_id', pfw.film_work_id, 'role', pfw.role))
            FILTER (WHERE pfw.film_work_id IS NOT NULL),
        '[]'
    ) AS roles,
    COALESCE(
        ARRAY_AGG(DISTINCT pfw.film_work_id) FILTER (WHERE pfw.film_work_id IS NOT NULL),
        '{}'
    ) AS film_ids
FROM content.person p
LEFT JOIN content.person_film_work pfw ON pfw.person_id = p.id
WHERE (p.updated_at, p.id) > ($1, $2)
GROUP BY p.id
ORDER BY p.updated_at, p.id
LIMIT $3
"#;

pub const GENRES: &str = r#"
SELECT id, name, updated_at
FROM content.genre
WHERE (updated_at, id) > ($1, $2)
ORDER BY updated_at, id
LIMIT $3
"#;
