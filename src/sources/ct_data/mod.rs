//! Connecticut Business Registry source, served from data.ct.gov's Socrata
//! API.
//!
//! One scope aggregates the whole registry; each entry is one dataset.
//! Datasets are fetched page by page until a short page, flattened into one
//! table each, and keyed with deterministic per-record UUIDs.

use crate::engine::row::{CellValue, Row};
use crate::engine::source::{EntryId, ScrapeError, Source, TableRows};
use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::Rng;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;

pub const DEFAULT_SCOPE: &str = "ct_business_registry";

/// The registry's datasets: output table name → Socrata dataset id.
pub const DATASETS: &[(&str, &str)] = &[
    ("businesses", "n7gp-d28j"),
    ("filings", "ah3s-bes7"),
    ("agents", "qh2m-n44y"),
    ("principals", "ka36-64k6"),
    ("name_changes", "enwv-52we"),
];

/// Resolve a CLI-supplied name (table name or raw dataset id) to a dataset id.
pub fn dataset_id(name: &str) -> Option<&'static str> {
    DATASETS
        .iter()
        .find(|(table, id)| *table == name || *id == name)
        .map(|(_, id)| *id)
}

fn table_for_dataset(dataset: &str) -> Option<&'static str> {
    DATASETS
        .iter()
        .find(|(_, id)| *id == dataset)
        .map(|(table, _)| *table)
}

pub struct CtDataSource {
    client: Client,
    page_size: usize,
}

impl CtDataSource {
    pub fn new(request_timeout: Duration, page_size: usize) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("harvest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            page_size: page_size.max(1),
        })
    }

    /// Fetch one dataset page with retry and exponential backoff on
    /// connection and timeout failures. A non-2xx status means the dataset is
    /// not servable and is reported as an invalid entry, never retried.
    async fn fetch_page(
        &self,
        base_url: &str,
        dataset: &str,
        offset: usize,
    ) -> Result<Vec<Map<String, Value>>, ScrapeError> {
        let url = format!("{base_url}/{dataset}.json");
        let mut delay = INITIAL_RETRY_DELAY;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            match self.try_fetch(&url, offset).await {
                Ok(body) => {
                    if attempt > 0 {
                        info!(
                            dataset = %dataset,
                            attempt = attempt + 1,
                            "request succeeded after retry"
                        );
                    }
                    return parse_page(&body, dataset, offset);
                }
                Err(FetchError::InvalidDataset(message)) => {
                    return Err(ScrapeError::InvalidEntry(message));
                }
                Err(FetchError::Transient(error)) => {
                    if attempt < MAX_RETRIES {
                        warn!(
                            dataset = %dataset,
                            offset,
                            attempt = attempt + 1,
                            retry_in = ?delay,
                            %error,
                            "request failed, retrying"
                        );
                        let jitter = rand::rng().random_range(1.0..1.25);
                        tokio::time::sleep(delay.mul_f64(jitter)).await;
                        delay *= BACKOFF_FACTOR;
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(ScrapeError::Failed(
            last_error.unwrap_or_else(|| anyhow::anyhow!("request failed: {url}")),
        ))
    }

    async fn try_fetch(&self, url: &str, offset: usize) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .query(&[
                ("$limit", self.page_size.to_string()),
                ("$offset", offset.to_string()),
            ])
            .send()
            .await
            .map_err(|error| FetchError::Transient(error.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::InvalidDataset(format!("HTTP {status} for {url}")));
        }
        response
            .text()
            .await
            .map_err(|error| FetchError::Transient(error.into()))
    }
}

/// How one page fetch can fail: a dataset the server won't serve (skipped,
/// never retried), or a transient transport error (retried with backoff).
enum FetchError {
    InvalidDataset(String),
    Transient(anyhow::Error),
}

fn parse_page(
    body: &str,
    dataset: &str,
    offset: usize,
) -> Result<Vec<Map<String, Value>>, ScrapeError> {
    let deserializer = &mut serde_json::Deserializer::from_str(body);
    let page: Vec<Map<String, Value>> =
        serde_path_to_error::deserialize(deserializer).map_err(|error| {
            anyhow::anyhow!(
                "dataset {dataset} page at offset {offset}: invalid JSON at {}: {}",
                error.path(),
                error.inner()
            )
        })?;
    Ok(page)
}

/// Stable per-record key from the record's own content, so repeated fetches
/// of an unchanged record agree without a server-side primary key.
fn record_uuid(record: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(record).unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    let digest: [u8; 16] = hasher.finalize().into();
    Uuid::from_bytes(digest).to_string()
}

#[async_trait]
impl Source for CtDataSource {
    fn source_key(&self) -> &'static str {
        "ct_data"
    }

    async fn scrape(&self, base_url: &str, entry_id: &EntryId) -> Result<Value, ScrapeError> {
        let dataset = entry_id.to_string();
        let table = table_for_dataset(&dataset).unwrap_or(dataset.as_str()).to_owned();

        let mut records: Vec<Value> = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.fetch_page(base_url, &dataset, offset).await?;
            let fetched = page.len();
            debug!(dataset = %dataset, offset, fetched, "fetched dataset page");
            records.extend(page.into_iter().map(Value::Object));
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        info!(dataset = %dataset, records = records.len(), "dataset fetched");
        Ok(json!({
            "dataset": dataset,
            "table": table,
            "rows": records,
        }))
    }

    fn flatten(&self, results: &[Value]) -> TableRows {
        let mut tables = TableRows::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for result in results {
            let Some(table) = result.get("table").and_then(Value::as_str) else {
                continue;
            };
            for record in result
                .get("rows")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(object) = record.as_object() else {
                    continue;
                };
                let uuid = record_uuid(object);
                if !seen.insert((table.to_owned(), uuid.clone())) {
                    continue;
                }
                let mut row = Row::new();
                row.insert("uuid".to_owned(), CellValue::Str(uuid));
                for (key, value) in object {
                    row.insert(key.clone(), CellValue::from_json(value));
                }
                tables.entry(table.to_owned()).or_default().push(row);
            }
        }

        tables
    }

    /// Datasets are "known" when their table directory exists in the scope.
    fn known_entry_ids(&self, data_dir: &Path, scope_key: &str) -> anyhow::Result<Vec<EntryId>> {
        let scope_dir = data_dir.join(scope_key);
        Ok(DATASETS
            .iter()
            .filter(|(table, _)| scope_dir.join(table).is_dir())
            .map(|(_, id)| EntryId::Str((*id).to_owned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> CtDataSource {
        CtDataSource::new(Duration::from_secs(30), 1000).unwrap()
    }

    fn fake_result(dataset: &str, table: &str, rows: Value) -> Value {
        json!({"dataset": dataset, "table": table, "rows": rows})
    }

    #[test]
    fn test_dataset_id_accepts_table_name_or_id() {
        assert_eq!(dataset_id("businesses"), Some("n7gp-d28j"));
        assert_eq!(dataset_id("n7gp-d28j"), Some("n7gp-d28j"));
        assert_eq!(dataset_id("bogus"), None);
    }

    #[test]
    fn test_flatten_assigns_deterministic_uuids() {
        let result = fake_result(
            "n7gp-d28j",
            "businesses",
            json!([{"name": "ACME LLC", "status": "Active"}]),
        );
        let first = source().flatten(std::slice::from_ref(&result));
        let second = source().flatten(&[result]);
        assert_eq!(
            first["businesses"][0].get("uuid"),
            second["businesses"][0].get("uuid")
        );
    }

    #[test]
    fn test_flatten_dedupes_identical_records() {
        let result = fake_result(
            "n7gp-d28j",
            "businesses",
            json!([
                {"name": "ACME LLC", "status": "Active"},
                {"name": "ACME LLC", "status": "Active"},
                {"name": "OTHER INC", "status": "Active"}
            ]),
        );
        let tables = source().flatten(&[result]);
        assert_eq!(tables["businesses"].len(), 2);
    }

    #[test]
    fn test_flatten_stringifies_nested_values() {
        let result = fake_result(
            "qh2m-n44y",
            "agents",
            json!([{"name": "A", "address": {"line1": "1 Main St"}}]),
        );
        let tables = source().flatten(&[result]);
        let row = &tables["agents"][0];
        assert!(matches!(row.get("address"), Some(CellValue::Str(_))));
    }

    #[test]
    fn test_known_entry_ids_from_table_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().join(DEFAULT_SCOPE);
        std::fs::create_dir_all(scope.join("businesses")).unwrap();
        std::fs::create_dir_all(scope.join("filings")).unwrap();

        let ids = source().known_entry_ids(dir.path(), DEFAULT_SCOPE).unwrap();
        assert_eq!(
            ids,
            vec![
                EntryId::Str("n7gp-d28j".into()),
                EntryId::Str("ah3s-bes7".into())
            ]
        );
    }

    #[test]
    fn test_known_entry_ids_empty_scope() {
        let dir = tempfile::tempdir().unwrap();
        let ids = source().known_entry_ids(dir.path(), DEFAULT_SCOPE).unwrap();
        assert!(ids.is_empty());
    }
}
