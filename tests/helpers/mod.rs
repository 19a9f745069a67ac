//! Shared fixtures for the engine integration tests: an in-memory mock
//! source and parquet read-back helpers.

// not every test binary exercises every helper
#![allow(dead_code)]

use async_trait::async_trait;
use harvest::engine::row::{CellValue, Row};
use harvest::engine::source::{EntryId, PhotoItem, ScrapeError, Source, TableRows};
use harvest::engine::writer::{distinct_int_column, parquet_files};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A scriptable source: succeeds with a small property result by default,
/// with per-entry invalid/failure/value overrides.
#[derive(Default)]
pub struct MockSource {
    /// Entries that raise the invalid-entry error (silently skipped).
    pub invalid_ids: HashSet<i64>,
    /// Entries that fail with a generic error.
    pub fail_ids: HashSet<i64>,
    /// Every scrape fails when set.
    pub fail_all: bool,
    /// Per-entry assessment override; used to simulate source-side changes.
    pub assessments: HashMap<i64, f64>,
    /// Attach a building (with a photo URL) to every result.
    pub with_buildings: bool,
    pub scrape_calls: AtomicU64,
    pub download_calls: AtomicU64,
}

impl MockSource {
    pub fn result_for(&self, pid: i64) -> Value {
        let assessment = self.assessments.get(&pid).copied().unwrap_or(100_000.0);
        let mut result = json!({
            "property": {
                "uuid": format!("t-{pid}"),
                "pid": pid,
                "town": "Test",
                "assessment": assessment,
            },
        });
        if self.with_buildings {
            result["buildings"] = json!([{
                "property_uuid": format!("t-{pid}"),
                "pid": pid,
                "bid": 0,
                "year_built": 1950 + pid,
                "photo_url": format!("https://example.com/photo{pid}.jpg"),
            }]);
        }
        result
    }
}

#[async_trait]
impl Source for MockSource {
    fn source_key(&self) -> &'static str {
        "mock"
    }

    async fn scrape(&self, _base_url: &str, entry_id: &EntryId) -> Result<Value, ScrapeError> {
        self.scrape_calls.fetch_add(1, Ordering::SeqCst);
        let pid = entry_id.as_int().unwrap_or_default();
        if self.fail_all || self.fail_ids.contains(&pid) {
            return Err(ScrapeError::Failed(anyhow::anyhow!("network down")));
        }
        if self.invalid_ids.contains(&pid) {
            return Err(ScrapeError::InvalidEntry(format!("pid {pid} doesn't exist")));
        }
        Ok(self.result_for(pid))
    }

    fn flatten(&self, results: &[Value]) -> TableRows {
        let mut tables = TableRows::new();
        for result in results {
            if let Some(property) = result.get("property").and_then(Value::as_object) {
                let row: Row = property
                    .iter()
                    .map(|(k, v)| (k.clone(), CellValue::from_json(v)))
                    .collect();
                tables.entry("properties".to_owned()).or_default().push(row);
            }
            for building in result
                .get("buildings")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(object) = building.as_object() {
                    let row: Row = object
                        .iter()
                        .map(|(k, v)| (k.clone(), CellValue::from_json(v)))
                        .collect();
                    tables.entry("buildings".to_owned()).or_default().push(row);
                }
            }
        }
        tables
    }

    fn known_entry_ids(&self, data_dir: &Path, scope_key: &str) -> anyhow::Result<Vec<EntryId>> {
        let table_dir = data_dir.join(scope_key).join("properties");
        Ok(distinct_int_column(&table_dir, "pid")?
            .into_iter()
            .map(EntryId::Int)
            .collect())
    }

    fn photo_support(&self) -> bool {
        self.with_buildings
    }

    fn photo_items(&self, result: &Value, scope_key: &str, entry_id: &EntryId) -> Vec<PhotoItem> {
        result
            .get("buildings")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|building| building.get("photo_url").and_then(Value::as_str))
            .map(|url| PhotoItem {
                url: url.to_owned(),
                scope_key: scope_key.to_owned(),
                entry_id: entry_id.clone(),
            })
            .collect()
    }

    async fn download(&self, _item: &PhotoItem, _photo_dir: &Path) -> Option<PathBuf> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        Some(PathBuf::from("/tmp/photo.jpg"))
    }
}

/// Total row count across every parquet file of a table directory.
pub fn count_rows(table_dir: &Path) -> u64 {
    let mut total = 0u64;
    for path in parquet_files(table_dir) {
        let file = std::fs::File::open(&path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        total += builder.metadata().file_metadata().num_rows() as u64;
    }
    total
}

/// Number of parquet files in a table directory.
pub fn file_count(table_dir: &Path) -> usize {
    parquet_files(table_dir).len()
}

/// Parse a scope's checkpoint JSON.
pub fn read_checkpoint(data_dir: &Path, scope_key: &str) -> Value {
    let path = data_dir
        .join("_checkpoints")
        .join(format!("{scope_key}.json"));
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}
