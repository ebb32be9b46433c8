//! Durable per-stream watermarks.
//!
//! The store is a single JSON object mapping stream key to watermark:
//!
//! ```json
//! {
//!   "film_work": {"updated_at": "2021-06-16T20:14:09Z", "id": "3d825f60-..."},
//!   "genres": "2021-06-16T20:14:09Z"
//! }
//! ```
//!
//! A bare timestamp string is read as a watermark without tie-break id.
//! State files written by the earlier ETL keyed streams as `film_work_upd_at`,
//! `person_upd_at`, `genre_upd_at`, `persons_full_upd_at` and
//! `genres_full_upd_at`; those values seed the matching stream keys on load
//! when the stream key itself is absent.
//! A missing or unreadable file means "no prior state": every key reads as
//! the epoch. Every `set` rewrites the whole file through a temporary sibling
//! and a rename, so a crash mid-write leaves the previous file intact.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::pipeline::Watermark;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Stored {
    Keyed { updated_at: DateTime<Utc>, id: Uuid },
    Timestamp(DateTime<Utc>),
    Naive(NaiveDateTime),
    /// Unrecognized value, kept as-is on rewrite.
    Other(Value),
}

impl From<Watermark> for Stored {
    fn from(wm: Watermark) -> Self {
        match wm.id {
            Some(id) => Stored::Keyed {
                updated_at: wm.updated_at,
                id,
            },
            None => Stored::Timestamp(wm.updated_at),
        }
    }
}

impl Stored {
    fn watermark(&self) -> Option<Watermark> {
        match self {
            Stored::Keyed { updated_at, id } => Some(Watermark::new(*updated_at, *id)),
            Stored::Timestamp(ts) => Some(Watermark::at(*ts)),
            Stored::Naive(ts) => Some(Watermark::at(ts.and_utc())),
            Stored::Other(_) => None,
        }
    }
}

/// Earlier ETL state key → stream key.
const LEGACY_KEYS: [(&str, &str); 5] = [
    ("film_work_upd_at", "film_work"),
    ("person_upd_at", "film_work_persons"),
    ("genre_upd_at", "film_work_genres"),
    ("persons_full_upd_at", "persons"),
    ("genres_full_upd_at", "genres"),
];

pub struct ProgressStore {
    path: PathBuf,
    entries: BTreeMap<String, Stored>,
}

impl ProgressStore {
    /// Loads the store at `path`. Never fails: a missing or corrupt file
    /// starts from an empty state.
    pub fn open(path: &Path) -> Self {
        let mut entries: BTreeMap<String, Stored> = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "progress file unreadable, starting from epoch");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "progress file unreadable, starting from epoch");
                BTreeMap::new()
            }
        };

        for (legacy, key) in LEGACY_KEYS {
            if entries.contains_key(key) {
                continue;
            }
            if let Some(stored) = entries.get(legacy).cloned() {
                entries.insert(key.to_string(), stored);
            }
        }

        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted watermark of `key`, or the epoch if it was never set.
    pub fn get(&self, key: &str) -> Watermark {
        match self.entries.get(key) {
            Some(stored) => stored.watermark().unwrap_or_else(|| {
                warn!(key, "unrecognized progress value, starting from epoch");
                Watermark::epoch()
            }),
            None => Watermark::epoch(),
        }
    }

    /// Records `watermark` for `key` and writes the whole store to disk.
    pub fn set(&mut self, key: &str, watermark: Watermark) -> Result<()> {
        self.entries.insert(key.to_string(), watermark.into());
        self.persist()
    }

    /// Rewinds `key` to the epoch.
    pub fn reset(&mut self, key: &str) -> Result<()> {
        self.set(key, Watermark::epoch())
    }

    /// Every key with a readable watermark, in key order.
    pub fn entries(&self) -> Vec<(String, Watermark)> {
        self.entries
            .iter()
            .filter_map(|(key, stored)| stored.watermark().map(|wm| (key.clone(), wm)))
            .collect()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory: {}", parent.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write progress file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace progress file: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 16, 20, 14, 9).unwrap()
    }

    #[test]
    fn missing_file_reads_epoch() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.json"));
        assert_eq!(store.get("film_work"), Watermark::epoch());
        assert!(store.entries().is_empty());
    }

    #[test]
    fn corrupt_file_reads_epoch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = ProgressStore::open(&path);
        assert_eq!(store.get("genres"), Watermark::epoch());
    }

    #[test]
    fn set_is_written_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("progress.json");
        let mut store = ProgressStore::open(&path);
        let wm = Watermark::new(ts(), Uuid::from_u128(7));
        store.set("film_work", wm).unwrap();

        let reopened = ProgressStore::open(&path);
        assert_eq!(reopened.get("film_work"), wm);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn bare_timestamp_reads_without_tie_break() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(
            &path,
            r#"{"persons": "2021-06-16T20:14:09+00:00", "genres": "2021-06-16T20:14:09"}"#,
        )
        .unwrap();
        let store = ProgressStore::open(&path);
        assert_eq!(store.get("persons"), Watermark::at(ts()));
        assert_eq!(store.get("genres"), Watermark::at(ts()));
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, r#"{"legacy": {"cursor": 3}}"#).unwrap();
        let mut store = ProgressStore::open(&path);
        store.set("genres", Watermark::at(ts())).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["legacy"]["cursor"], 3);
        assert_eq!(store.get("legacy"), Watermark::epoch());
    }

    #[test]
    fn earlier_etl_keys_seed_stream_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(
            &path,
            r#"{
                "film_work_upd_at": "2021-06-16T20:14:09+00:00",
                "person_upd_at": "2021-06-16T20:14:09",
                "genres_full_upd_at": "1970-01-01T00:00:00+00:00",
                "genres": "2021-06-16T20:14:09+00:00"
            }"#,
        )
        .unwrap();
        let store = ProgressStore::open(&path);
        assert_eq!(store.get("film_work"), Watermark::at(ts()));
        assert_eq!(store.get("film_work_persons"), Watermark::at(ts()));
        assert_eq!(store.get("film_work_genres"), Watermark::epoch());
        // An existing stream key wins over its legacy alias
        assert_eq!(store.get("genres"), Watermark::at(ts()));
    }

    #[test]
    fn reset_rewinds_to_epoch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let mut store = ProgressStore::open(&path);
        store.set("persons", Watermark::at(ts())).unwrap();
        store.reset("persons").unwrap();
        assert_eq!(ProgressStore::open(&path).get("persons"), Watermark::epoch());
    }
}
