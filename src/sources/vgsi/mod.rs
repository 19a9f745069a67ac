//! VGSI property-registry source.
//!
//! One scope per municipality; entries are parcel IDs. Parcel pages are
//! HTML-scraped with retry and exponential backoff, exploded into the
//! property/building/valuation tables, and optionally mined for building
//! photos.

pub mod parser;

use crate::engine::row::{CellValue, Row, compute_row_hash};
use crate::engine::source::{EntryId, PhotoItem, ScrapeError, Source, TableRows};
use crate::engine::writer::distinct_int_column;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;

/// Per-city base URL on the shared VGSI host.
pub fn base_url_for_city(city: &str) -> String {
    format!("https://gis.vgsi.com/{city}ct/")
}

pub struct VgsiSource {
    client: Client,
}

impl VgsiSource {
    /// The registry serves self-signed certificates, so verification is off
    /// for this client only.
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .user_agent(concat!("harvest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Fetch a parcel page with retry and exponential backoff. Invalid
    /// parcels are detected from the error-redirect form and never retried.
    async fn fetch_page(&self, base_url: &str, pid: i64) -> Result<String, ScrapeError> {
        let url = format!("{base_url}Parcel.aspx?pid={pid}");
        let mut delay = INITIAL_RETRY_DELAY;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            match self.try_fetch(&url).await {
                Ok(body) => {
                    if parser::is_error_page(&body) {
                        return Err(ScrapeError::InvalidEntry(format!(
                            "pid {pid} does not exist"
                        )));
                    }
                    if attempt > 0 {
                        info!(pid, attempt = attempt + 1, "request succeeded after retry");
                    }
                    return Ok(body);
                }
                Err(error) => {
                    if attempt < MAX_RETRIES {
                        warn!(
                            pid,
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

    async fn try_fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Copy scalar fields of a JSON object into a row, in key order.
fn object_to_row(object: &serde_json::Map<String, Value>) -> Row {
    object
        .iter()
        .map(|(key, value)| (key.clone(), CellValue::from_json(value)))
        .collect()
}

#[async_trait]
impl Source for VgsiSource {
    fn source_key(&self) -> &'static str {
        "vgsi"
    }

    async fn scrape(&self, base_url: &str, entry_id: &EntryId) -> Result<Value, ScrapeError> {
        let pid = entry_id
            .as_int()
            .ok_or_else(|| anyhow::anyhow!("vgsi entry ids are numeric, got {entry_id}"))?;
        let html = self.fetch_page(base_url, pid).await?;
        Ok(parser::parse_parcel(&html, pid))
    }

    fn flatten(&self, results: &[Value]) -> TableRows {
        let mut tables = TableRows::new();
        let mut seen_sales: HashSet<String> = HashSet::new();

        for result in results {
            if let Some(property) = result.get("property").and_then(Value::as_object) {
                tables
                    .entry("properties".to_owned())
                    .or_default()
                    .push(object_to_row(property));
            }

            for building in result
                .get("buildings")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(object) = building.as_object() else {
                    continue;
                };

                let mut row = Row::new();
                for (key, value) in object {
                    match key.as_str() {
                        // nested construction details become prefixed columns
                        "construction" => {
                            for (detail, detail_value) in
                                value.as_object().into_iter().flatten()
                            {
                                row.insert(
                                    format!("construction_{detail}"),
                                    CellValue::from_json(detail_value),
                                );
                            }
                        }
                        // sub-areas get their own table below
                        "sub_areas" => {}
                        _ => {
                            row.insert(key.clone(), CellValue::from_json(value));
                        }
                    }
                }

                for sub_area in object
                    .get("sub_areas")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(sub_object) = sub_area.as_object() else {
                        continue;
                    };
                    let mut sub_row = object_to_row(sub_object);
                    for parent_key in ["property_uuid", "pid", "bid"] {
                        if let Some(value) = object.get(parent_key) {
                            sub_row.insert(parent_key.to_owned(), CellValue::from_json(value));
                        }
                    }
                    tables
                        .entry("building_sub_areas".to_owned())
                        .or_default()
                        .push(sub_row);
                }

                tables.entry("buildings".to_owned()).or_default().push(row);
            }

            for table in [
                "ownership",
                "assessments",
                "appraisals",
                "extra_features",
                "outbuildings",
            ] {
                for item in result
                    .get(table)
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(object) = item.as_object() else {
                        continue;
                    };
                    let row = object_to_row(object);
                    // Sales grids repeat the current owner line; dedupe on
                    // content within this invocation.
                    if table == "ownership" && !seen_sales.insert(compute_row_hash(&row, &[])) {
                        continue;
                    }
                    tables.entry(table.to_owned()).or_default().push(row);
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
        true
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

    async fn download(&self, item: &PhotoItem, photo_dir: &Path) -> Option<PathBuf> {
        if item.url.to_ascii_lowercase().contains("default.jpg") {
            return None;
        }

        let city_dir = photo_dir.join(&item.scope_key);
        if let Err(error) = tokio::fs::create_dir_all(&city_dir).await {
            warn!(%error, dir = %city_dir.display(), "failed to create photo dir");
            return None;
        }
        let local_path = city_dir.join(format!("{}.jpg", item.entry_id));
        if local_path.exists() {
            return Some(local_path);
        }

        let bytes = match self.try_download(&item.url).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(entry_id = %item.entry_id, %error, "failed to download photo");
                return None;
            }
        };
        if let Err(error) = tokio::fs::write(&local_path, &bytes).await {
            warn!(%error, path = %local_path.display(), "failed to write photo");
            return None;
        }
        debug!(entry_id = %item.entry_id, path = %local_path.display(), "downloaded photo");
        Some(local_path)
    }
}

impl VgsiSource {
    async fn try_download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> VgsiSource {
        VgsiSource::new(Duration::from_secs(30)).unwrap()
    }

    fn fake_result(pid: i64) -> Value {
        json!({
            "property": {"uuid": format!("t-{pid}"), "pid": pid, "town_name": "Test Town"},
            "buildings": [{
                "property_uuid": format!("t-{pid}"),
                "pid": pid,
                "bid": 0,
                "year_built": 1950,
                "photo_url": format!("https://example.com/photo{pid}.jpg"),
                "construction": {"style": "Colonial"},
                "sub_areas": [
                    {"code": "BAS", "description": "First Floor", "gross_area": 1200.0, "living_area": 1200.0}
                ],
            }],
            "ownership": [
                {"owner": "DOE JOHN", "sale_price": 250000.0, "property_uuid": format!("t-{pid}"), "pid": pid},
                {"owner": "DOE JOHN", "sale_price": 250000.0, "property_uuid": format!("t-{pid}"), "pid": pid}
            ],
        })
    }

    #[test]
    fn test_flatten_explodes_tables() {
        let tables = source().flatten(&[fake_result(1), fake_result(2)]);
        assert_eq!(tables["properties"].len(), 2);
        assert_eq!(tables["buildings"].len(), 2);
        assert_eq!(tables["building_sub_areas"].len(), 2);
    }

    #[test]
    fn test_flatten_prefixes_construction_details() {
        let tables = source().flatten(&[fake_result(1)]);
        let building = &tables["buildings"][0];
        assert_eq!(
            building.get("construction_style"),
            Some(&CellValue::Str("Colonial".into()))
        );
        assert!(!building.contains_key("sub_areas"));
    }

    #[test]
    fn test_flatten_dedupes_sales_rows() {
        let tables = source().flatten(&[fake_result(1)]);
        // the duplicated owner line collapses to one row
        assert_eq!(tables["ownership"].len(), 1);
    }

    #[test]
    fn test_sub_areas_carry_parent_keys() {
        let tables = source().flatten(&[fake_result(7)]);
        let sub_row = &tables["building_sub_areas"][0];
        assert_eq!(
            sub_row.get("property_uuid"),
            Some(&CellValue::Str("t-7".into()))
        );
        assert_eq!(sub_row.get("bid"), Some(&CellValue::Int(0)));
    }

    #[test]
    fn test_photo_items_skip_missing_urls() {
        let src = source();
        let mut result = fake_result(1);
        let items = src.photo_items(&result, "testcity", &EntryId::Int(1));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://example.com/photo1.jpg");

        result["buildings"][0]["photo_url"] = Value::Null;
        let items = src.photo_items(&result, "testcity", &EntryId::Int(1));
        assert!(items.is_empty());
    }
}
