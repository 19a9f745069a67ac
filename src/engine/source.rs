//! The contract every remote source implements.
//!
//! The engine never imports source internals; all source-specific behavior —
//! fetching, parsing, flattening into tables, querying already-scraped IDs,
//! optional photo downloads — is routed through this trait.

use crate::engine::row::Row;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier of one unit of scraping work within a scope: a parcel ID for a
/// property registry, a dataset key for an open-data portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Int(i64),
    Str(String),
}

impl EntryId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EntryId::Int(i) => Some(*i),
            EntryId::Str(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Int(i) => write!(f, "{i}"),
            EntryId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntryId {
    fn from(i: i64) -> Self {
        EntryId::Int(i)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId::Str(s.to_owned())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId::Str(s)
    }
}

/// How a scrape can fail. The engine skips `InvalidEntry` silently; anything
/// else counts toward the error totals and the circuit breaker.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("entry does not exist: {0}")]
    InvalidEntry(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// One photo download dispatched after a successful scrape.
#[derive(Debug, Clone)]
pub struct PhotoItem {
    pub url: String,
    pub scope_key: String,
    pub entry_id: EntryId,
}

/// Per-table rows produced by flattening a batch of scrape results.
pub type TableRows = IndexMap<String, Vec<Row>>;

#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier for this source (e.g. `vgsi`).
    fn source_key(&self) -> &'static str;

    /// Fetch one entry. The returned value is opaque to the engine; it is
    /// only ever handed back to this source's [`flatten`](Source::flatten).
    async fn scrape(&self, base_url: &str, entry_id: &EntryId) -> Result<Value, ScrapeError>;

    /// Explode a batch of scrape results into per-table flat rows. Pure; may
    /// deduplicate on a natural key within one invocation.
    fn flatten(&self, results: &[Value]) -> TableRows;

    /// Query the existing files for entry IDs already scraped into this
    /// scope. Drives refresh mode; may return empty.
    fn known_entry_ids(&self, data_dir: &Path, scope_key: &str) -> anyhow::Result<Vec<EntryId>>;

    /// Whether this source can enumerate and download photos. When false the
    /// engine never calls [`photo_items`](Source::photo_items) or
    /// [`download`](Source::download).
    fn photo_support(&self) -> bool {
        false
    }

    /// Downloads to dispatch for one successful scrape result.
    fn photo_items(&self, _result: &Value, _scope_key: &str, _entry_id: &EntryId) -> Vec<PhotoItem> {
        Vec::new()
    }

    /// Perform one download. Idempotent on an existing file; returns the
    /// local path, or `None` on skip or failure. Failures are the source's
    /// to log — the engine never counts them as scrape errors.
    async fn download(&self, _item: &PhotoItem, _photo_dir: &Path) -> Option<PathBuf> {
        None
    }
}
