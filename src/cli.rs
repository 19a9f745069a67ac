//! Command-line interface.
//!
//! Two scraping modes plus a convenience sweep:
//! - `load`: iterate fresh entry IDs for a source and scrape them
//! - `refresh`: re-scrape every known entry of a scope, change-only
//! - `refresh-all`: refresh every scope of every source found on disk

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-source data harvester: scrapes remote registries into append-only
/// parquet with change detection, checkpointing, and resume.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Pretty;
#[cfg(not(debug_assertions))]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Json;

fn default_tracing_format() -> TracingFormat {
    DEFAULT_TRACING_FORMAT
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scrape new entries from a source
    Load {
        #[command(flatten)]
        target: SourceArgs,
        #[command(flatten)]
        shared: SharedArgs,
        /// Save progress every N successful entries
        #[arg(long, default_value_t = 100)]
        checkpoint_every: u64,
        /// Start from scratch instead of resuming from the last checkpoint
        #[arg(long)]
        no_resume: bool,
        /// Highest entry ID to attempt (required for vgsi)
        #[arg(long)]
        entry_id_max: Option<i64>,
        /// Dataset subset for ct_data (table names or dataset ids)
        #[arg(long, value_delimiter = ',')]
        datasets: Option<Vec<String>>,
    },
    /// Re-scrape known entries of a scope, writing only changed rows
    Refresh {
        #[command(flatten)]
        target: SourceArgs,
        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Refresh every scope of every source found under the data directory
    RefreshAll {
        #[command(flatten)]
        shared: SharedArgs,
    },
}

#[derive(clap::Args, Debug)]
pub struct SourceArgs {
    /// Data source key (vgsi, ct_data)
    pub source: String,
    /// Scope key within the source (e.g. a city for vgsi)
    pub scope: Option<String>,
    /// Override the source base URL
    #[arg(long)]
    pub base_url: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct SharedArgs {
    /// Number of concurrent workers
    #[arg(long, default_value_t = 10)]
    pub workers: usize,
    /// Outbound requests per second (0 disables spacing)
    #[arg(long, default_value_t = 5.0)]
    pub rate: f64,
    /// Write to parquet every N results
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,
    /// Abort after N consecutive errors (0 disables the circuit breaker)
    #[arg(long, default_value_t = 50)]
    pub max_consecutive_errors: u32,
    /// Suppress progress logging
    #[arg(long)]
    pub quiet: bool,
    /// Download photos for sources that support them
    #[arg(long)]
    pub download_photos: bool,
    /// Directory for downloaded photos
    #[arg(long)]
    pub photo_dir: Option<PathBuf>,
    /// Parquet output directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}
