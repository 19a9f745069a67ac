//! Row model and content hashing for change detection.
//!
//! Every table row is an ordered map of column name to scalar cell. The hash
//! covers a row's content only: metadata columns and null cells are excluded,
//! and the remaining cells are serialized as a sorted-key JSON object before
//! digesting, so insertion order never affects the result.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One output row: column name → scalar cell, in insertion order.
///
/// Insertion order drives the column layout of the written files; it is
/// deliberately irrelevant to the content hash.
pub type Row = IndexMap<String, CellValue>;

/// A single scalar cell. The writer infers parquet column types from these.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Canonical text rendering used for hashing and for stringly columns.
    /// Returns `None` for null cells, which never participate in the hash.
    pub fn canonical(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Str(s) => Some(s.clone()),
            CellValue::Timestamp(ts) => {
                Some(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }

    /// Convert a scraped JSON scalar into a cell. Nested containers should
    /// have been exploded by the source's `flatten`; any that slip through
    /// are stored as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> CellValue {
        match value {
            serde_json::Value::Null => CellValue::Null,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Int(i)
                } else {
                    CellValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => CellValue::Str(s.clone()),
            other => CellValue::Str(other.to_string()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Str(s.to_owned())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Str(s)
    }
}

impl From<i64> for CellValue {
    fn from(i: i64) -> Self {
        CellValue::Int(i)
    }
}

impl From<f64> for CellValue {
    fn from(f: f64) -> Self {
        CellValue::Float(f)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl<T> From<Option<T>> for CellValue
where
    T: Into<CellValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(CellValue::Null, Into::into)
    }
}

/// Columns that never participate in the content hash: versioning metadata,
/// internal identifiers, and locally-derived paths. Excluding them keeps
/// trivial churn (a new scrape timestamp, a re-downloaded photo) from
/// registering as a content change.
pub const HASH_EXCLUDED_COLUMNS: &[&str] = &[
    "id",
    "version",
    "row_hash",
    "effective_from",
    "effective_to",
    "is_current",
    "loaded_at",
    "updated_at",
    "created_at",
    "scraped_at",
    "city_id",
    "vgsi_url",
    "photo_paths",
    "photo_local_path",
];

/// Compute the 128-bit content hash of a row as 32 lowercase hex characters.
///
/// Deterministic for the same logical content under any insertion order.
pub fn compute_row_hash(row: &Row, extra_exclude: &[&str]) -> String {
    let mut content: BTreeMap<&str, String> = BTreeMap::new();
    for (key, value) in row {
        let key = key.as_str();
        if HASH_EXCLUDED_COLUMNS.contains(&key) || extra_exclude.contains(&key) {
            continue;
        }
        if let Some(text) = value.canonical() {
            content.insert(key, text);
        }
    }

    // BTreeMap serializes with lexicographically sorted keys
    let canonical = serde_json::to_string(&content).unwrap_or_default();

    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(32);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(cells: &[(&str, CellValue)]) -> Row {
        cells
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hash_is_32_hex_chars() {
        let r = row(&[("town", "New Haven".into()), ("pid", 42i64.into())]);
        let hash = compute_row_hash(&r, &[]);
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash.to_lowercase());
    }

    #[test]
    fn test_hash_ignores_insertion_order() {
        let a = row(&[
            ("town", "New Haven".into()),
            ("pid", 42i64.into()),
            ("assessment", 100_000.0.into()),
        ]);
        let b = row(&[
            ("assessment", 100_000.0.into()),
            ("pid", 42i64.into()),
            ("town", "New Haven".into()),
        ]);
        assert_eq!(compute_row_hash(&a, &[]), compute_row_hash(&b, &[]));
    }

    #[test]
    fn test_hash_excludes_metadata_columns() {
        let base = row(&[("town", "New Haven".into()), ("pid", 42i64.into())]);
        let with_metadata = row(&[
            ("town", "New Haven".into()),
            ("pid", 42i64.into()),
            ("scraped_at", CellValue::Timestamp(Utc::now())),
            ("row_hash", "deadbeef".into()),
            ("version", 3i64.into()),
        ]);
        assert_eq!(
            compute_row_hash(&base, &[]),
            compute_row_hash(&with_metadata, &[])
        );
    }

    #[test]
    fn test_hash_drops_null_cells() {
        let sparse = row(&[("town", "New Haven".into()), ("owner", CellValue::Null)]);
        let dense = row(&[("town", "New Haven".into())]);
        assert_eq!(compute_row_hash(&sparse, &[]), compute_row_hash(&dense, &[]));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = row(&[("assessment", 100_000.0.into())]);
        let b = row(&[("assessment", 999_000.0.into())]);
        assert_ne!(compute_row_hash(&a, &[]), compute_row_hash(&b, &[]));
    }

    #[test]
    fn test_extra_excludes_are_honored() {
        let a = row(&[("town", "New Haven".into()), ("noise", "x".into())]);
        let b = row(&[("town", "New Haven".into()), ("noise", "y".into())]);
        assert_ne!(compute_row_hash(&a, &[]), compute_row_hash(&b, &[]));
        assert_eq!(
            compute_row_hash(&a, &["noise"]),
            compute_row_hash(&b, &["noise"])
        );
    }

    #[test]
    fn test_canonical_timestamp_is_stable() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 14, 15, 0, 0).unwrap();
        let a = row(&[("sale_date", CellValue::Timestamp(ts))]);
        let b = row(&[("sale_date", CellValue::Timestamp(ts))]);
        assert_eq!(compute_row_hash(&a, &[]), compute_row_hash(&b, &[]));
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(
            CellValue::from_json(&serde_json::json!(42)),
            CellValue::Int(42)
        );
        assert_eq!(
            CellValue::from_json(&serde_json::json!(1.5)),
            CellValue::Float(1.5)
        );
        assert_eq!(
            CellValue::from_json(&serde_json::json!("x")),
            CellValue::Str("x".into())
        );
        assert_eq!(
            CellValue::from_json(&serde_json::json!(null)),
            CellValue::Null
        );
        assert_eq!(
            CellValue::from_json(&serde_json::json!(true)),
            CellValue::Bool(true)
        );
    }
}
