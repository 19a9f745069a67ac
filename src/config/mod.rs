//! Configuration module for the harvester.
//!
//! Configuration is loaded from `HARVEST_`-prefixed environment variables
//! using the figment crate, with serde defaults for everything. Duration
//! fields accept both numeric values (interpreted as seconds) and duration
//! strings with units.

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration. CLI flags override the corresponding
/// fields where both exist.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Log level for this application's target specifically, e.g. "debug"
    /// behaves like "warn,harvest=debug". Defaults to "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Parquet output directory (default: "data")
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for downloaded photos (default: "photos")
    #[serde(default = "default_photo_dir")]
    pub photo_dir: PathBuf,

    /// Per-request HTTP timeout for the scrape clients
    ///
    /// Accepts both numeric values (seconds) and duration strings.
    /// Defaults to 30 seconds.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,

    /// Base URL for the Connecticut open data API
    #[serde(default = "default_ct_data_base_url")]
    pub ct_data_base_url: String,

    /// Page size for paginated dataset fetches
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            photo_dir: default_photo_dir(),
            request_timeout: default_request_timeout(),
            ct_data_base_url: default_ct_data_base_url(),
            page_size: default_page_size(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_photo_dir() -> PathBuf {
    PathBuf::from("photos")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ct_data_base_url() -> String {
    "https://data.ct.gov/resource".to_string()
}

fn default_page_size() -> usize {
    50_000
}

/// Duration parser handling seconds (default unit), milliseconds, and
/// minutes, with optional whitespace between number and unit.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::Second, TimeUnit::MilliSecond, TimeUnit::Minute])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserialize a duration from either a bare number of seconds or a string
/// like "30s", "1500ms", "2 m".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration format '{value}': {e}. Examples: '5' (5 seconds), '3500ms', '30s', '2m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
