//! # filmsync
//!
//! Keeps an Elasticsearch film catalog in sync with its Postgres system of
//! record, and serves the catalog through a cached read-only HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌───────────────┐
//! │ Postgres │──▶│ Producer→Enricher→Merger  │──▶│ Elasticsearch │
//! │ content  │   │ per stream, watermarked   │   │ movies/genres │
//! └──────────┘   └─────────────┬─────────────┘   │ /persons      │
//!                              │                 └───────┬───────┘
//!                              ▼                         ▼
//!                      ┌───────────────┐         ┌──────────────┐
//!                      │ progress.json │         │ HTTP API     │
//!                      └───────────────┘         │ + Redis cache│
//!                                                └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`pipeline`] | Three-stage batch streams and query windows |
//! | [`streams`] | The five synced streams and their stage chains |
//! | [`sync`] | Pass orchestration, watermark persistence, shutdown |
//! | [`progress`] | Durable per-stream watermarks |
//! | [`source`] | Postgres row source with reconnect-and-retry |
//! | [`queries`] | SQL text |
//! | [`models`] | Records and index documents |
//! | [`sink`] | Bulk upsert into Elasticsearch |
//! | [`indices`] | Index settings and mappings |
//! | [`search`] | Search engine read access |
//! | [`cache`] | Read-through cache (Redis or in-memory) |
//! | [`services`] | Catalog queries behind the API |
//! | [`server`] | HTTP API |
//! | [`db`] | Postgres pool |

pub mod cache;
pub mod config;
pub mod db;
pub mod indices;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod queries;
pub mod search;
pub mod server;
pub mod services;
pub mod sink;
pub mod source;
pub mod streams;
pub mod sync;
