//! Append-only parquet writer for scrape results.
//!
//! Each batch is flattened into per-table rows, stamped with `scraped_at` and
//! `row_hash`, and appended as a new zstd-compressed file under
//! `<data_dir>/<scope>/<table>/`. Nothing is edited in place while a session
//! runs; the data stays queryable throughout. Also owns the JSON checkpoint
//! files, the preloaded hash cache that makes refresh runs change-only, and
//! the end-of-session compaction of this writer's own files.

use crate::engine::row::{CellValue, Row, compute_row_hash};
use crate::engine::source::{EntryId, Source};
use crate::error::Result;
use anyhow::{Context, bail};
use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Array, Int64Builder, StringArray,
    StringBuilder, TimestampMicrosecondBuilder, new_null_array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const FILE_EXT: &str = "parquet";
const CHECKPOINT_DIR: &str = "_checkpoints";

/// Per-scope resumption breadcrumb, stored as
/// `<data_dir>/_checkpoints/<scope_key>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scope_key: String,
    pub last_entry_id: String,
    pub total_scraped: u64,
    pub checkpoint_time: DateTime<Utc>,
}

/// Rows written vs. suppressed-as-unchanged over this session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub rows_written: u64,
    pub rows_skipped: u64,
}

struct WriterState {
    batch_num: u32,
    /// `table → known hashes`, populated by [`ParquetWriter::preload_hashes`].
    /// While `Some`, writes are change-only.
    existing_hashes: Option<HashMap<String, HashSet<String>>>,
    rows_written: u64,
    rows_skipped: u64,
}

/// Thread-safe append-only writer for one scope. All file mutation happens
/// under its internal mutex; share it via `Arc` and dispatch from async
/// contexts with `spawn_blocking`.
pub struct ParquetWriter {
    scope_key: String,
    source: Arc<dyn Source>,
    data_dir: PathBuf,
    scope_dir: PathBuf,
    /// Prefix of every file this writer emits; the boundary for compaction.
    session_ts: String,
    state: Mutex<WriterState>,
}

impl ParquetWriter {
    pub fn new(scope_key: &str, source: Arc<dyn Source>, data_dir: &Path) -> Self {
        let scope_dir = data_dir.join(scope_key);
        let session_ts = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        info!(scope_dir = %scope_dir.display(), session = %session_ts, "parquet writer initialized");
        Self {
            scope_key: scope_key.to_owned(),
            source,
            data_dir: data_dir.to_owned(),
            scope_dir,
            session_ts,
            state: Mutex::new(WriterState {
                batch_num: 0,
                existing_hashes: None,
                rows_written: 0,
                rows_skipped: 0,
            }),
        }
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn session_timestamp(&self) -> &str {
        &self.session_ts
    }

    /// Flatten a batch of scrape results and append the resulting rows, one
    /// new file per table. When the hash cache is active, rows whose content
    /// hash is already known are dropped, and surviving hashes are recorded
    /// so intra-session duplicates are skipped too.
    pub fn write_batch(&self, results: &[serde_json::Value]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let tables = self.source.flatten(results);
        let scraped_at = Utc::now();

        let mut state = self.lock_state();
        let batch_num = state.batch_num;
        state.batch_num += 1;

        for (table_name, mut rows) in tables {
            if rows.is_empty() {
                continue;
            }

            for row in &mut rows {
                row.insert("scraped_at".to_owned(), CellValue::Timestamp(scraped_at));
                let hash = compute_row_hash(row, &[]);
                row.insert("row_hash".to_owned(), CellValue::Str(hash));
            }

            let mut skipped = 0u64;
            if let Some(cache) = state.existing_hashes.as_mut() {
                let known = cache.entry(table_name.clone()).or_default();
                rows.retain(|row| {
                    let hash = match row.get("row_hash") {
                        Some(CellValue::Str(h)) => h.clone(),
                        _ => return true,
                    };
                    if known.contains(&hash) {
                        skipped += 1;
                        false
                    } else {
                        known.insert(hash);
                        true
                    }
                });
            }
            state.rows_skipped += skipped;

            if rows.is_empty() {
                continue;
            }
            state.rows_written += rows.len() as u64;

            let table_dir = self.scope_dir.join(&table_name);
            fs::create_dir_all(&table_dir)
                .with_context(|| format!("creating table dir {}", table_dir.display()))?;
            let out_path =
                table_dir.join(format!("{}_{batch_num:04}.{FILE_EXT}", self.session_ts));

            let batch = build_record_batch(&rows)?;
            write_parquet_file(&batch, &out_path)?;
            debug!(
                rows = rows.len(),
                table = %table_name,
                file = %out_path.display(),
                "wrote batch"
            );
        }

        Ok(())
    }

    /// Load every table's known `row_hash` values from the existing files
    /// into the cache. Called once before a refresh run; afterwards
    /// [`write_batch`](Self::write_batch) skips unchanged rows. An empty or
    /// missing scope initializes an empty cache.
    pub fn preload_hashes(&self) -> Result<()> {
        let mut cache: HashMap<String, HashSet<String>> = HashMap::new();

        if self.scope_dir.exists() {
            for entry in fs::read_dir(&self.scope_dir)
                .with_context(|| format!("reading scope dir {}", self.scope_dir.display()))?
            {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                let table_name = entry.file_name().to_string_lossy().into_owned();
                cache.insert(table_name, load_table_hashes(&entry.path()));
            }
        }

        let total: usize = cache.values().map(HashSet::len).sum();
        info!(
            hashes = total,
            tables = cache.len(),
            "preloaded existing row hashes"
        );
        self.lock_state().existing_hashes = Some(cache);
        Ok(())
    }

    pub fn stats(&self) -> WriteStats {
        let state = self.lock_state();
        WriteStats {
            rows_written: state.rows_written,
            rows_skipped: state.rows_skipped,
        }
    }

    /// Overwrite this scope's checkpoint, renaming through a temp file so a
    /// crash mid-write leaves either the old or the new checkpoint behind.
    pub fn save_checkpoint(
        &self,
        scope_key: &str,
        last_entry_id: &EntryId,
        total_scraped: u64,
    ) -> Result<()> {
        let _state = self.lock_state();
        let dir = self.data_dir.join(CHECKPOINT_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;

        let checkpoint = Checkpoint {
            scope_key: scope_key.to_owned(),
            last_entry_id: last_entry_id.to_string(),
            total_scraped,
            checkpoint_time: Utc::now(),
        };

        let path = dir.join(format!("{scope_key}.json"));
        let tmp = dir.join(format!("{scope_key}.json.tmp"));
        fs::write(&tmp, serde_json::to_vec(&checkpoint)?)?;
        fs::rename(&tmp, &path)?;

        info!(
            scope_key,
            last_entry_id = %checkpoint.last_entry_id,
            total_scraped,
            "checkpoint saved"
        );
        Ok(())
    }

    /// `(last_entry_id, total_scraped)`, or `(None, 0)` when the checkpoint
    /// is missing or unreadable. A truncated file is tolerated, not fatal.
    pub fn last_checkpoint(&self, scope_key: &str) -> (Option<String>, u64) {
        let path = self
            .data_dir
            .join(CHECKPOINT_DIR)
            .join(format!("{scope_key}.json"));
        if !path.exists() {
            return (None, 0);
        }
        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<Checkpoint>(&text).map_err(Into::into));
        match parsed {
            Ok(checkpoint) => {
                info!(
                    scope_key,
                    last_entry_id = %checkpoint.last_entry_id,
                    total_scraped = checkpoint.total_scraped,
                    "found checkpoint"
                );
                (Some(checkpoint.last_entry_id), checkpoint.total_scraped)
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "invalid checkpoint file, ignoring");
                (None, 0)
            }
        }
    }

    /// Entry IDs already present in this scope's files. Delegates to the
    /// source, which knows its own key columns.
    pub fn known_entry_ids(&self) -> Result<Vec<EntryId>> {
        self.source.known_entry_ids(&self.data_dir, &self.scope_key)
    }

    /// Merge this session's files into one file per table. Files from other
    /// sessions are never touched. Per-table failures (e.g. a column whose
    /// inferred type drifted between batches) leave that table's files
    /// as-is.
    pub fn compact(&self) {
        let _state = self.lock_state();
        if !self.scope_dir.exists() {
            return;
        }
        let entries = match fs::read_dir(&self.scope_dir) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(scope_dir = %self.scope_dir.display(), %error, "compaction skipped");
                return;
            }
        };

        for entry in entries.flatten() {
            let table_dir = entry.path();
            if !table_dir.is_dir() {
                continue;
            }

            let prefix = format!("{}_", self.session_ts);
            let mut session_files: Vec<PathBuf> = parquet_files(&table_dir)
                .into_iter()
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(&prefix))
                })
                .collect();
            session_files.sort();
            if session_files.len() <= 1 {
                continue;
            }

            match compact_table(&table_dir, &session_files, &self.session_ts) {
                Ok(()) => info!(
                    table = %table_dir.display(),
                    files = session_files.len(),
                    "compacted session files"
                ),
                Err(error) => warn!(
                    table = %table_dir.display(),
                    %error,
                    "compaction failed for table, leaving session files in place"
                ),
            }
        }
    }

    /// Idempotent; the writer holds no open file handles between calls.
    pub fn close(&self) {
        info!(scope_dir = %self.scope_dir.display(), "parquet writer closed");
    }

    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// All `.parquet` files directly under `dir`, unordered. Empty when the
/// directory does not exist.
pub fn parquet_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == FILE_EXT)
        })
        .collect()
}

/// Distinct values of a string column across every file of a table, sorted.
/// Files missing the column are skipped.
pub fn distinct_string_column(table_dir: &Path, column: &str) -> Result<Vec<String>> {
    let mut values = BTreeSet::new();
    for path in parquet_files(table_dir) {
        for batch in project_column(&path, column)? {
            let batch = batch?;
            if let Some(array) = batch.column(0).as_any().downcast_ref::<StringArray>() {
                for value in array.iter().flatten() {
                    values.insert(value.to_owned());
                }
            }
        }
    }
    Ok(values.into_iter().collect())
}

/// Distinct values of an integer column across every file of a table, sorted.
pub fn distinct_int_column(table_dir: &Path, column: &str) -> Result<Vec<i64>> {
    let mut values = BTreeSet::new();
    for path in parquet_files(table_dir) {
        for batch in project_column(&path, column)? {
            let batch = batch?;
            if let Some(array) = batch.column(0).as_any().downcast_ref::<Int64Array>() {
                for value in array.iter().flatten() {
                    values.insert(value);
                }
            }
        }
    }
    Ok(values.into_iter().collect())
}

/// Open one parquet file projected down to a single column. Yields nothing
/// when the column is absent from the file's schema.
fn project_column(
    path: &Path,
    column: &str,
) -> Result<Box<dyn Iterator<Item = std::result::Result<RecordBatch, arrow::error::ArrowError>>>>
{
    let file =
        File::open(path).with_context(|| format!("opening parquet file {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata of {}", path.display()))?;
    let Ok(index) = builder.schema().index_of(column) else {
        return Ok(Box::new(std::iter::empty()));
    };
    let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
    let reader = builder
        .with_projection(mask)
        .build()
        .with_context(|| format!("building projected reader for {}", path.display()))?;
    Ok(Box::new(reader))
}

/// Union of `row_hash` values across a table's files. Unreadable files are
/// logged and skipped so one bad file never blocks a refresh.
fn load_table_hashes(table_dir: &Path) -> HashSet<String> {
    match distinct_string_column(table_dir, "row_hash") {
        Ok(values) => values.into_iter().collect(),
        Err(error) => {
            warn!(table = %table_dir.display(), %error, "failed to load existing hashes");
            HashSet::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Int,
    Float,
    Bool,
    Utf8,
    Timestamp,
}

impl ColumnType {
    fn data_type(self) -> DataType {
        match self {
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Timestamp => {
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            }
        }
    }
}

/// Resolve a column's type from the cells present in this batch. Int and
/// float mix to float; any other mix (or an all-null column) falls back to
/// strings via the canonical rendering.
fn resolve_column_type(rows: &[Row], column: &str) -> ColumnType {
    let (mut ints, mut floats, mut bools, mut strs, mut timestamps) =
        (false, false, false, false, false);
    for row in rows {
        match row.get(column) {
            Some(CellValue::Int(_)) => ints = true,
            Some(CellValue::Float(_)) => floats = true,
            Some(CellValue::Bool(_)) => bools = true,
            Some(CellValue::Str(_)) => strs = true,
            Some(CellValue::Timestamp(_)) => timestamps = true,
            Some(CellValue::Null) | None => {}
        }
    }

    if strs {
        ColumnType::Utf8
    } else if timestamps {
        if ints || floats || bools {
            ColumnType::Utf8
        } else {
            ColumnType::Timestamp
        }
    } else if bools {
        if ints || floats {
            ColumnType::Utf8
        } else {
            ColumnType::Bool
        }
    } else if floats {
        ColumnType::Float
    } else if ints {
        ColumnType::Int
    } else {
        ColumnType::Utf8
    }
}

/// Convert a batch of rows into an arrow record batch, inferring the schema
/// from the cells. Column order is first-seen order across the batch.
fn build_record_batch(rows: &[Row]) -> Result<RecordBatch> {
    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.as_str()) {
                columns.push(key.clone());
            }
        }
    }

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());

    for column in &columns {
        let column_type = resolve_column_type(rows, column);
        fields.push(Field::new(column, column_type.data_type(), true));
        arrays.push(build_column(rows, column, column_type));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("assembling record batch")
}

fn build_column(rows: &[Row], column: &str, column_type: ColumnType) -> ArrayRef {
    match column_type {
        ColumnType::Int => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for row in rows {
                match row.get(column) {
                    Some(CellValue::Int(i)) => builder.append_value(*i),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Float => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                match row.get(column) {
                    Some(CellValue::Float(f)) => builder.append_value(*f),
                    Some(CellValue::Int(i)) => builder.append_value(*i as f64),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Bool => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                match row.get(column) {
                    Some(CellValue::Bool(b)) => builder.append_value(*b),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Timestamp => {
            let mut builder =
                TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
            for row in rows {
                match row.get(column) {
                    Some(CellValue::Timestamp(ts)) => builder.append_value(ts.timestamp_micros()),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Utf8 => {
            let mut builder = StringBuilder::new();
            for row in rows {
                match row.get(column).and_then(CellValue::canonical) {
                    Some(text) => builder.append_value(text),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

fn write_parquet_file(batch: &RecordBatch, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("finalizing parquet file")?;
    Ok(())
}

/// Merge one table's session files into `<session_ts>.parquet`, deleting the
/// constituents on success. Column sets may differ across batches (schema is
/// inferred per batch); missing columns are null-filled against the union
/// schema. Conflicting column types abort the merge for this table.
fn compact_table(table_dir: &Path, files: &[PathBuf], session_ts: &str) -> Result<()> {
    let mut batches: Vec<RecordBatch> = Vec::new();
    for path in files {
        let file = File::open(path)
            .with_context(|| format!("opening session file {}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading parquet metadata of {}", path.display()))?
            .build()
            .with_context(|| format!("building reader for {}", path.display()))?;
        for batch in reader {
            batches.push(batch?);
        }
    }
    if batches.is_empty() {
        return Ok(());
    }

    let schema = union_schema(&batches)?;
    let out_path = table_dir.join(format!("{session_ts}.{FILE_EXT}"));
    let file = File::create(&out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
        .context("opening compacted parquet writer")?;
    for batch in &batches {
        writer.write(&align_to_schema(batch, &schema)?)?;
    }
    writer.close().context("finalizing compacted file")?;

    for path in files {
        fs::remove_file(path)
            .with_context(|| format!("removing session file {}", path.display()))?;
    }
    Ok(())
}

/// Union of the batch schemas in first-seen column order. All fields become
/// nullable; a column appearing with two different types is an error.
fn union_schema(batches: &[RecordBatch]) -> Result<SchemaRef> {
    let mut fields: Vec<Field> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for batch in batches {
        for field in batch.schema().fields() {
            match index.get(field.name()) {
                None => {
                    index.insert(field.name().clone(), fields.len());
                    fields.push(Field::new(field.name(), field.data_type().clone(), true));
                }
                Some(&i) => {
                    if fields[i].data_type() != field.data_type() {
                        bail!(
                            "column {} has conflicting types {:?} and {:?}",
                            field.name(),
                            fields[i].data_type(),
                            field.data_type()
                        );
                    }
                }
            }
        }
    }
    Ok(Arc::new(Schema::new(fields)))
}

fn align_to_schema(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.schema().index_of(field.name()) {
            Ok(i) => Arc::clone(batch.column(i)),
            Err(_) => new_null_array(field.data_type(), batch.num_rows()),
        })
        .collect();
    RecordBatch::try_new(schema.clone(), columns).context("aligning batch to union schema")
}
