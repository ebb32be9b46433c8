//! Read-only catalog API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/v1/films` | Sorted listing, optional `filter[genre]` |
//! | `GET` | `/api/v1/films/search?query=` | Full-text search over title and description |
//! | `GET` | `/api/v1/films/{id}` | Film detail |
//! | `GET` | `/api/v1/genres` | All genres |
//! | `GET` | `/api/v1/genres/{id}` | Genre detail |
//! | `GET` | `/api/v1/persons/search?query=` | Fuzzy search by full name |
//! | `GET` | `/api/v1/persons/{id}` | Person detail |
//! | `GET` | `/api/v1/persons/{id}/films` | Films a person took part in |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! Listings accept `page[size]` (1..=1000, default 50) and `page[number]`
//! (>= 1, default 1). The film listing accepts `sort` = `imdb_rating` or
//! `title.raw`, `-` prefixed for descending (default `-imdb_rating`).
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "film not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::{MemoryCache, ReadCache, RedisCache};
use crate::config::Config;
use crate::models::{FilmDetail, FilmShort, GenreView, PersonView};
use crate::search::ElasticSearch;
use crate::services::{Catalog, FilmListing, FilmSort, Page};

type AppState = Arc<Catalog>;

/// Starts the API on `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(ElasticSearch::new(&config.elastic)?);
    let cache: Arc<dyn ReadCache> = match &config.cache.url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            info!("no cache.url configured, caching in memory");
            Arc::new(MemoryCache::new())
        }
    };
    let catalog = Arc::new(Catalog::new(engine, cache, config.cache.ttl()));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "API listening");
    axum::serve(listener, router(catalog)).await?;

    Ok(())
}

pub fn router(catalog: Arc<Catalog>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/films", get(handle_films))
        .route("/films/search", get(handle_film_search))
        .route("/films/{id}", get(handle_film))
        .route("/genres", get(handle_genres))
        .route("/genres/{id}", get(handle_genre))
        .route("/persons/search", get(handle_person_search))
        .route("/persons/{id}", get(handle_person))
        .route("/persons/{id}/films", get(handle_person_films));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(catalog)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Backend failures are logged in full and reported without detail.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: "internal error".to_string(),
        }
    }
}

// ============ Query parameters ============

/// Raw listing parameters. Numbers arrive as strings so that malformed
/// values produce the JSON error body instead of a plain-text rejection.
#[derive(Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(rename = "page[size]", default)]
    page_size: Option<String>,
    #[serde(rename = "page[number]", default)]
    page_number: Option<String>,
    #[serde(rename = "filter[genre]", default)]
    filter_genre: Option<String>,
}

impl ListParams {
    fn page(&self) -> Result<Page, AppError> {
        let size = parse_number("page[size]", self.page_size.as_deref())?;
        let number = parse_number("page[number]", self.page_number.as_deref())?;
        Page::new(size, number).map_err(|e| bad_request(e.to_string()))
    }

    fn query(&self) -> Result<&str, AppError> {
        match self.query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => Ok(q),
            _ => Err(bad_request("query must not be empty")),
        }
    }
}

fn parse_number(name: &str, raw: Option<&str>) -> Result<Option<u32>, AppError> {
    raw.map(|value| {
        value
            .parse::<u32>()
            .map_err(|_| bad_request(format!("{} must be a positive integer", name)))
    })
    .transpose()
}

fn parse_id(raw: &str, entity: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid {} id: {}", entity, raw)))
}

// ============ Handlers ============

async fn handle_film(
    State(catalog): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FilmDetail>, AppError> {
    let id = parse_id(&id, "film")?;
    match catalog.film(id).await? {
        Some(film) => Ok(Json(film)),
        None => Err(not_found("film not found")),
    }
}

async fn handle_films(
    State(catalog): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FilmShort>>, AppError> {
    let sort = match params.sort.as_deref() {
        Some(raw) => FilmSort::parse(raw).map_err(|e| bad_request(e.to_string()))?,
        None => FilmSort::default(),
    };
    let listing = FilmListing {
        sort,
        page: params.page()?,
        genre: params.filter_genre.clone().filter(|g| !g.is_empty()),
    };
    Ok(Json(catalog.films(&listing).await?))
}

async fn handle_film_search(
    State(catalog): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FilmShort>>, AppError> {
    let page = params.page()?;
    let query = params.query()?;
    Ok(Json(catalog.search_films(query, page).await?))
}

async fn handle_genres(State(catalog): State<AppState>) -> Result<Json<Vec<GenreView>>, AppError> {
    Ok(Json(catalog.genres().await?))
}

async fn handle_genre(
    State(catalog): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GenreView>, AppError> {
    let id = parse_id(&id, "genre")?;
    match catalog.genre(id).await? {
        Some(genre) => Ok(Json(genre)),
        None => Err(not_found("genre not found")),
    }
}

async fn handle_person(
    State(catalog): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PersonView>, AppError> {
    let id = parse_id(&id, "person")?;
    match catalog.person(id).await? {
        Some(person) => Ok(Json(person)),
        None => Err(not_found("person not found")),
    }
}

async fn handle_person_search(
    State(catalog): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<PersonView>>, AppError> {
    let page = params.page()?;
    let query = params.query()?;
    Ok(Json(catalog.search_persons(query, page).await?))
}

async fn handle_person_films(
    State(catalog): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<FilmShort>>, AppError> {
    let id = parse_id(&id, "person")?;
    let films = catalog.films_by_person(id).await?;
    if films.is_empty() {
        return Err(not_found("person not found"));
    }
    Ok(Json(films))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
