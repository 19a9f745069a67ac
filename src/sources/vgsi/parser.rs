//! Field extraction for VGSI parcel pages.
//!
//! The pages are old ASP.NET markup: every value of interest sits in a
//! `<span>` with a stable element ID, and the history grids are flat
//! `<table>` elements. Extraction works over the raw markup with anchored
//! patterns plus entity unescaping; no DOM is built.

use md5::{Digest, Md5};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::warn;
use uuid::Uuid;

/// Form action of the "parcel not found" redirect.
const ERROR_ACTION: &str = "./Error.aspx?Message=There+was+an+error+loading+the+parcel.";

/// Span element IDs → property field names.
const PROPERTY_TAGS: &[(&str, &str)] = &[
    ("MainContent_lblPid", "pid"),
    ("MainContent_lblAcctNum", "account_number"),
    ("MainContent_lblMblu", "mblu"),
    ("lblTownName", "town_name"),
    ("MainContent_lblLocation", "address"),
    ("MainContent_lblGenOwner", "owner"),
    ("MainContent_lblAddr1", "owner_address"),
    ("MainContent_lblCoOwner", "co_owner"),
    ("MainContent_lblPrice", "sale_price"),
    ("MainContent_lblCertificate", "certificate"),
    ("MainContent_lblSaleDate", "sale_date"),
    ("MainContent_lblBp", "book_page"),
    ("MainContent_lblBookLabel", "book_label"),
    ("MainContent_lblBook", "book"),
    ("MainContent_lblPageLabel", "page_label"),
    ("MainContent_lblPage", "page"),
    ("MainContent_lblInstrument", "label_instrument"),
    ("MainContent_lblGenAssessment", "assessment_value"),
    ("MainContent_lblGenAppraisal", "appraisal_value"),
    ("MainContent_lblBldCount", "building_count"),
    ("MainContent_lblUseCode", "land_use_code"),
    ("MainContent_lblUseCodeDescription", "building_use"),
    ("MainContent_lblAltApproved", "land_alt_approved"),
    ("MainContent_lblZone", "land_zone"),
    ("MainContent_lblNbhd", "land_neighborhood_code"),
    ("MainContent_lblLndFront", "land_frontage"),
    ("MainContent_lblDepth", "land_depth"),
    ("MainContent_lblLndAsmt", "land_assessed_value"),
    ("MainContent_lblLndAppr", "land_appraised_value"),
    ("MainContent_lblZip", "zip_code"),
];

/// Land size carries a different element ID depending on the municipality.
const LAND_SIZE_IDS: &[&str] = &["MainContent_lblLndSize", "MainContent_lblLndAcres"];

const PROPERTY_MONEY_FIELDS: &[&str] = &[
    "sale_price",
    "assessment_value",
    "appraisal_value",
    "land_assessed_value",
    "land_appraised_value",
];

const PROPERTY_INT_FIELDS: &[&str] = &["building_count"];

static SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?si)<span[^>]*\bid\s*=\s*"([^"]*)"[^>]*>(.*?)</span>"#).expect("span pattern")
});

static TR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<tr[^>]*>(.*?)</tr>").expect("tr pattern"));

static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<t[dh][^>]*>(.*?)</t[dh]>").expect("cell pattern"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));

static FORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?si)<form[^>]*\bid\s*=\s*"form1"[^>]*>"#).expect("form pattern")
});

static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\baction\s*=\s*"([^"]*)""#).expect("action pattern"));

static SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bsrc\s*=\s*"([^"]*)""#).expect("src pattern"));

static SKETCH_IMG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?si)<img[^>]*\balt\s*=\s*"Building Layout"[^>]*>"#).expect("sketch pattern")
});

/// Collapse markup to readable text: drop tags, unescape entities, squeeze
/// whitespace.
fn tag_text(inner: &str) -> String {
    let stripped = TAG_RE.replace_all(inner, " ");
    let unescaped = htmlize::unescape(stripped.as_ref());
    unescaped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract every span's text keyed by element ID in one pass over the page.
pub fn span_map(html: &str) -> HashMap<String, String> {
    let mut spans = HashMap::new();
    for captures in SPAN_RE.captures_iter(html) {
        let id = captures[1].to_owned();
        if !id.is_empty() {
            spans.insert(id, tag_text(&captures[2]));
        }
    }
    spans
}

/// True when the page is the "parcel not found" error redirect.
pub fn is_error_page(html: &str) -> bool {
    FORM_RE
        .find(html)
        .and_then(|form| ACTION_RE.captures(form.as_str()))
        .is_some_and(|captures| &captures[1] == ERROR_ACTION)
}

// --- Type coercion ---

fn parse_money(value: &str) -> Option<f64> {
    let cleaned = value.trim().replace(['$', ','], "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn parse_float(value: &str) -> Option<f64> {
    value.trim().replace(',', "").parse().ok()
}

fn parse_int(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

fn clean_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn opt_json<T: Into<Value>>(value: Option<T>) -> Value {
    value.map_or(Value::Null, Into::into)
}

// --- Deterministic UUIDs ---

/// Derive a stable UUID from the parcel ID plus its parsed content, so
/// repeated scrapes of identical content agree on the key without any
/// coordination.
pub fn generate_uuid(pid: i64, data: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(data).unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(format!("{pid}{canonical}").as_bytes());
    let digest: [u8; 16] = hasher.finalize().into();
    Uuid::from_bytes(digest).to_string()
}

// --- Parsing ---

/// Parse property-level fields, type-coerced, with a deterministic `uuid`.
pub fn parse_property(spans: &HashMap<String, String>, pid: i64) -> Map<String, Value> {
    let mut data = Map::new();
    for (span_id, field) in PROPERTY_TAGS {
        if let Some(text) = spans.get(*span_id) {
            data.insert((*field).to_owned(), opt_json(clean_string(text)));
        }
    }

    let land_size = LAND_SIZE_IDS
        .iter()
        .find_map(|id| spans.get(*id))
        .and_then(|text| parse_float(text));
    data.insert("land_size_acres".to_owned(), opt_json(land_size));

    for field in PROPERTY_MONEY_FIELDS {
        if let Some(Value::String(text)) = data.get(*field).cloned() {
            data.insert((*field).to_owned(), opt_json(parse_money(&text)));
        }
    }
    for field in PROPERTY_INT_FIELDS {
        if let Some(Value::String(text)) = data.get(*field).cloned() {
            data.insert((*field).to_owned(), opt_json(parse_int(&text)));
        }
    }
    for field in ["land_frontage", "land_depth"] {
        if let Some(Value::String(text)) = data.get(field).cloned() {
            data.insert(field.to_owned(), opt_json(parse_float(&text)));
        }
    }

    let uuid = generate_uuid(pid, &data);
    data.insert("uuid".to_owned(), uuid.into());
    data.insert("pid".to_owned(), pid.into());
    data
}

/// Extract a `src` attribute from the first `<img>` carrying the given ID.
fn img_src(html: &str, img_id: &str) -> Option<String> {
    let pattern = format!(
        r#"(?si)<img[^>]*\bid\s*=\s*"{}"[^>]*>"#,
        regex::escape(img_id)
    );
    let tag = Regex::new(&pattern).ok()?.find(html)?;
    SRC_RE
        .captures(tag.as_str())
        .and_then(|captures| clean_string(&captures[1]))
}

/// Parse every building block on the page: core span fields, photo and
/// sketch URLs, the construction-details grid, and the sub-areas grid.
///
/// Building blocks are numbered `MainContent_ctl0N`; a few extra indexes are
/// probed past the declared count to absorb off-by-one pages.
pub fn parse_buildings(
    html: &str,
    spans: &HashMap<String, String>,
    building_count: i64,
    pid: i64,
) -> Vec<Map<String, Value>> {
    let expected = building_count.max(0);
    let mut buildings = Vec::new();

    for bid in 0..expected + 3 {
        let prefix = format!("MainContent_ctl0{}", bid + 2);

        let year = spans.get(&format!("{prefix}_lblYearBuilt"));
        let area = spans.get(&format!("{prefix}_lblBldArea"));
        if year.is_none() && area.is_none() {
            if bid < expected {
                warn!(pid, bid, "building block not found on page");
            }
            continue;
        }

        let mut building = Map::new();
        building.insert("bid".to_owned(), bid.into());
        building.insert(
            "year_built".to_owned(),
            opt_json(year.and_then(|text| parse_int(text))),
        );
        building.insert(
            "building_area".to_owned(),
            opt_json(area.and_then(|text| parse_float(text))),
        );
        building.insert(
            "replacement_cost".to_owned(),
            opt_json(
                spans
                    .get(&format!("{prefix}_lblRcn"))
                    .and_then(|text| parse_money(text)),
            ),
        );
        building.insert(
            "less_depreciation".to_owned(),
            opt_json(
                spans
                    .get(&format!("{prefix}_lblRcnld"))
                    .and_then(|text| parse_money(text)),
            ),
        );
        building.insert(
            "pct_good".to_owned(),
            opt_json(
                spans
                    .get(&format!("{prefix}_lblPctGood"))
                    .and_then(|text| parse_int(text)),
            ),
        );

        let photo_url = img_src(html, &format!("{prefix}_imgPhoto"))
            .filter(|url| !url.to_ascii_lowercase().contains("default.jpg"));
        building.insert("photo_url".to_owned(), opt_json(photo_url));

        let sketch_url = SKETCH_IMG_RE.find(html).and_then(|tag| {
            SRC_RE
                .captures(tag.as_str())
                .and_then(|captures| clean_string(&captures[1]))
        });
        building.insert("sketch_url".to_owned(), opt_json(sketch_url));

        building.insert(
            "construction".to_owned(),
            Value::Object(parse_construction_details(html, &prefix)),
        );
        building.insert(
            "sub_areas".to_owned(),
            Value::Array(
                parse_sub_areas(html, &prefix)
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            ),
        );

        buildings.push(building);
    }

    buildings
}

fn table_body(html: &str, table_id: &str) -> Option<String> {
    let pattern = format!(
        r#"(?si)<table[^>]*\bid\s*=\s*"{}"[^>]*>(.*?)</table>"#,
        regex::escape(table_id)
    );
    Regex::new(&pattern)
        .ok()?
        .captures(html)
        .map(|captures| captures[1].to_owned())
}

fn table_rows(body: &str) -> Vec<Vec<String>> {
    TR_RE
        .captures_iter(body)
        .map(|row| {
            CELL_RE
                .captures_iter(&row[1])
                .map(|cell| tag_text(&cell[1]))
                .collect()
        })
        .collect()
}

fn normalize_header(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .replace(' ', "_")
        .replace('&', "and")
}

/// Parse the construction-details grid (`grdCns`): key/value pairs, keys
/// normalized to column-name form.
fn parse_construction_details(html: &str, prefix: &str) -> Map<String, Value> {
    let Some(body) = table_body(html, &format!("{prefix}_grdCns")) else {
        return Map::new();
    };
    let mut details = Map::new();
    for cells in table_rows(&body) {
        if cells.len() >= 2 && !cells[1].is_empty() {
            let key = normalize_header(cells[0].trim_end_matches(':'));
            details.insert(key, cells[1].clone().into());
        }
    }
    details
}

/// Parse the sub-areas grid (`grdSub`): code, description, gross and living
/// area. The header row and the trailing totals row (empty code) are skipped.
fn parse_sub_areas(html: &str, prefix: &str) -> Vec<Map<String, Value>> {
    let Some(body) = table_body(html, &format!("{prefix}_grdSub")) else {
        return Vec::new();
    };
    let rows = table_rows(&body);
    if rows.len() < 2 {
        return Vec::new();
    }

    let mut sub_areas = Vec::new();
    for cells in &rows[1..] {
        if cells.len() < 4 || cells[0].is_empty() {
            continue;
        }
        let mut area = Map::new();
        area.insert("code".to_owned(), cells[0].clone().into());
        area.insert("description".to_owned(), opt_json(clean_string(&cells[1])));
        area.insert("gross_area".to_owned(), opt_json(parse_float(&cells[2])));
        area.insert("living_area".to_owned(), opt_json(parse_float(&cells[3])));
        sub_areas.push(area);
    }
    sub_areas
}

/// Generic grid parser for the sales, valuation-history, extra-feature and
/// outbuilding tables: headers from the first row, values from the rest.
pub fn parse_grid(html: &str, table_id: &str, money_fields: &[&str]) -> Vec<Map<String, Value>> {
    let Some(body) = table_body(html, table_id) else {
        return Vec::new();
    };
    if tag_text(&body).contains("No Data") {
        return Vec::new();
    }

    let rows = table_rows(&body);
    if rows.len() < 2 {
        return Vec::new();
    }

    let headers: Vec<String> = rows[0].iter().map(|cell| normalize_header(cell)).collect();
    if headers.is_empty() {
        return Vec::new();
    }

    let mut results = Vec::new();
    for cells in &rows[1..] {
        let mut row = Map::new();
        for (header, value) in headers.iter().zip(cells) {
            if money_fields.contains(&header.as_str()) {
                row.insert(header.clone(), opt_json(parse_money(value)));
            } else {
                row.insert(header.clone(), opt_json(clean_string(value)));
            }
        }
        if row.values().any(|value| !value.is_null()) {
            results.push(row);
        }
    }
    results
}

/// Parse a full parcel page into the scrape result consumed by `flatten`.
pub fn parse_parcel(html: &str, pid: i64) -> Value {
    let spans = span_map(html);
    let property = parse_property(&spans, pid);
    let property_uuid = property
        .get("uuid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let building_count = property
        .get("building_count")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let attach = |mut row: Map<String, Value>| -> Value {
        row.insert("property_uuid".to_owned(), property_uuid.clone().into());
        row.insert("pid".to_owned(), pid.into());
        Value::Object(row)
    };

    let buildings: Vec<Value> = parse_buildings(html, &spans, building_count, pid)
        .into_iter()
        .map(attach)
        .collect();
    let ownership: Vec<Value> = parse_grid(html, "MainContent_grdSales", &["sale_price"])
        .into_iter()
        .map(attach)
        .collect();
    let appraisals: Vec<Value> = parse_grid(
        html,
        "MainContent_grdHistoryValuesAppr",
        &["improvements", "land", "total"],
    )
    .into_iter()
    .map(attach)
    .collect();
    let assessments: Vec<Value> = parse_grid(
        html,
        "MainContent_grdHistoryValuesAsmt",
        &["improvements", "land", "total"],
    )
    .into_iter()
    .map(attach)
    .collect();
    let extra_features: Vec<Value> =
        parse_grid(html, "MainContent_grdXf", &["value", "assessed_value"])
            .into_iter()
            .map(attach)
            .collect();
    let outbuildings: Vec<Value> =
        parse_grid(html, "MainContent_grdOb", &["value", "assessed_value"])
            .into_iter()
            .map(attach)
            .collect();

    json!({
        "property": Value::Object(property),
        "buildings": buildings,
        "assessments": assessments,
        "appraisals": appraisals,
        "ownership": ownership,
        "extra_features": extra_features,
        "outbuildings": outbuildings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARCEL_PAGE: &str = r#"
        <html><body>
        <form method="post" action="./Parcel.aspx?pid=42" id="form1">
        <span id="lblTownName">Test Town</span>
        <span id="MainContent_lblPid">42</span>
        <span id="MainContent_lblLocation">5 Main St</span>
        <span id="MainContent_lblGenOwner">DOE JOHN &amp; JANE</span>
        <span id="MainContent_lblGenAssessment">$100,000</span>
        <span id="MainContent_lblGenAppraisal">$142,900</span>
        <span id="MainContent_lblBldCount">1</span>
        <span id="MainContent_lblLndAcres">0.25</span>
        <span id="MainContent_ctl02_lblYearBuilt">1955</span>
        <span id="MainContent_ctl02_lblBldArea">2,000</span>
        <span id="MainContent_ctl02_lblRcn">$180,000</span>
        <span id="MainContent_ctl02_lblRcnld">$120,000</span>
        <span id="MainContent_ctl02_lblPctGood">67</span>
        <img id="MainContent_ctl02_imgPhoto" src="https://example.com/photos/42.jpg" />
        <table id="MainContent_ctl02_grdCns">
            <tr><td>Style:</td><td>Colonial</td></tr>
            <tr><td>Heat Type:</td><td>Forced Air</td></tr>
        </table>
        <table id="MainContent_ctl02_grdSub">
            <tr><th>Code</th><th>Description</th><th>Gross Area</th><th>Living Area</th></tr>
            <tr><td>BAS</td><td>First Floor</td><td>1,200</td><td>1,200</td></tr>
            <tr><td></td><td></td><td>2,000</td><td>1,200</td></tr>
        </table>
        <table id="MainContent_grdSales">
            <tr><th>Owner</th><th>Sale Price</th><th>Sale Date</th></tr>
            <tr><td>DOE JOHN</td><td>$250,000</td><td>01/15/2019</td></tr>
            <tr><td>SMITH ANN</td><td>$0</td><td>06/02/1998</td></tr>
        </table>
        <table id="MainContent_grdHistoryValuesAsmt">
            <tr><th>Valuation Year</th><th>Improvements</th><th>Land</th><th>Total</th></tr>
            <tr><td>2023</td><td>$80,000</td><td>$20,000</td><td>$100,000</td></tr>
        </table>
        <table id="MainContent_grdXf">
            <tr><td>No Data for Extra Features</td></tr>
        </table>
        </form>
        </body></html>
    "#;

    const ERROR_PAGE: &str = r#"
        <html><body>
        <form method="post" action="./Error.aspx?Message=There+was+an+error+loading+the+parcel." id="form1">
        </form>
        </body></html>
    "#;

    #[test]
    fn test_error_page_detection() {
        assert!(is_error_page(ERROR_PAGE));
        assert!(!is_error_page(PARCEL_PAGE));
    }

    #[test]
    fn test_span_extraction_unescapes_entities() {
        let spans = span_map(PARCEL_PAGE);
        assert_eq!(spans["MainContent_lblGenOwner"], "DOE JOHN & JANE");
        assert_eq!(spans["lblTownName"], "Test Town");
    }

    #[test]
    fn test_parse_property_coerces_types() {
        let spans = span_map(PARCEL_PAGE);
        let property = parse_property(&spans, 42);
        assert_eq!(property["pid"], json!(42));
        assert_eq!(property["assessment_value"], json!(100_000.0));
        assert_eq!(property["appraisal_value"], json!(142_900.0));
        assert_eq!(property["building_count"], json!(1));
        assert_eq!(property["land_size_acres"], json!(0.25));
        assert_eq!(property["address"], json!("5 Main St"));
        assert!(property["uuid"].as_str().is_some_and(|u| u.len() == 36));
    }

    #[test]
    fn test_property_uuid_is_deterministic() {
        let spans = span_map(PARCEL_PAGE);
        let a = parse_property(&spans, 42);
        let b = parse_property(&spans, 42);
        assert_eq!(a["uuid"], b["uuid"]);
        let other = parse_property(&spans, 43);
        assert_ne!(a["uuid"], other["uuid"]);
    }

    #[test]
    fn test_parse_buildings() {
        let spans = span_map(PARCEL_PAGE);
        let buildings = parse_buildings(PARCEL_PAGE, &spans, 1, 42);
        assert_eq!(buildings.len(), 1);
        let building = &buildings[0];
        assert_eq!(building["year_built"], json!(1955));
        assert_eq!(building["building_area"], json!(2000.0));
        assert_eq!(building["replacement_cost"], json!(180_000.0));
        assert_eq!(building["pct_good"], json!(67));
        assert_eq!(
            building["photo_url"],
            json!("https://example.com/photos/42.jpg")
        );
        assert_eq!(building["construction"]["style"], json!("Colonial"));
        assert_eq!(building["construction"]["heat_type"], json!("Forced Air"));
        let sub_areas = building["sub_areas"].as_array().unwrap();
        // totals row (empty code) is skipped
        assert_eq!(sub_areas.len(), 1);
        assert_eq!(sub_areas[0]["code"], json!("BAS"));
        assert_eq!(sub_areas[0]["gross_area"], json!(1200.0));
    }

    #[test]
    fn test_parse_grid_sales() {
        let rows = parse_grid(PARCEL_PAGE, "MainContent_grdSales", &["sale_price"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["owner"], json!("DOE JOHN"));
        assert_eq!(rows[0]["sale_price"], json!(250_000.0));
        assert_eq!(rows[1]["sale_price"], json!(0.0));
    }

    #[test]
    fn test_parse_grid_no_data() {
        let rows = parse_grid(PARCEL_PAGE, "MainContent_grdXf", &["value"]);
        assert!(rows.is_empty());
        let rows = parse_grid(PARCEL_PAGE, "MainContent_grdOb", &["value"]);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_parcel_attaches_parent_keys() {
        let result = parse_parcel(PARCEL_PAGE, 42);
        let uuid = result["property"]["uuid"].as_str().unwrap();
        for table in ["buildings", "ownership", "assessments"] {
            for row in result[table].as_array().unwrap() {
                assert_eq!(row["property_uuid"].as_str().unwrap(), uuid);
                assert_eq!(row["pid"], json!(42));
            }
        }
        assert_eq!(result["ownership"].as_array().unwrap().len(), 2);
        assert!(result["extra_features"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_money_parsing() {
        assert_eq!(parse_money("$1,234,567"), Some(1_234_567.0));
        assert_eq!(parse_money("  $0 "), Some(0.0));
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("n/a"), None);
    }
}
