//! Multi-source data harvester.
//!
//! A generic, concurrent, resumable scraping engine ([`engine`]) plus the
//! concrete sources that plug into it ([`sources`]). Results land in
//! append-only parquet keyed for content-change detection; the engine knows
//! nothing about any particular source's domain.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod sources;
