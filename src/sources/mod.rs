//! Source registry: construction and CLI-parameter resolution per source.
//!
//! The engine stays generic; everything that knows a concrete source by name
//! lives here.

pub mod ct_data;
pub mod vgsi;

use crate::cli::SourceArgs;
use crate::config::Config;
use crate::engine::source::{EntryId, Source};
use crate::engine::IterEntriesFn;
use crate::error::{Result, UsageError};
use std::path::Path;
use std::sync::Arc;
use url::Url;

pub const SOURCE_KEYS: &[&str] = &["vgsi", "ct_data"];

/// A source plus the run parameters resolved from CLI args and config.
pub struct Resolved {
    pub source: Arc<dyn Source>,
    pub base_url: String,
    pub scope_key: String,
}

pub fn create_source(key: &str, config: &Config) -> Result<Arc<dyn Source>> {
    match key {
        "vgsi" => Ok(Arc::new(vgsi::VgsiSource::new(config.request_timeout)?)),
        "ct_data" => Ok(Arc::new(ct_data::CtDataSource::new(
            config.request_timeout,
            config.page_size,
        )?)),
        other => Err(UsageError(format!(
            "unknown source '{other}' (expected one of: {})",
            SOURCE_KEYS.join(", ")
        ))
        .into()),
    }
}

/// Resolve CLI args into a source, scope key, and base URL. The base URL is
/// validated here so a bad one fails before any worker starts.
pub fn resolve(args: &SourceArgs, config: &Config) -> Result<Resolved> {
    let source = create_source(&args.source, config)?;
    let resolved = resolve_params(args, config, source)?;
    if Url::parse(&resolved.base_url).is_err() {
        return Err(UsageError(format!("invalid base URL '{}'", resolved.base_url)).into());
    }
    Ok(resolved)
}

fn resolve_params(
    args: &SourceArgs,
    config: &Config,
    source: Arc<dyn Source>,
) -> Result<Resolved> {
    match args.source.as_str() {
        "vgsi" => {
            let scope_key = args.scope.clone().ok_or_else(|| {
                UsageError("vgsi requires a city scope (e.g. `harvest load vgsi newhaven`)".into())
            })?;
            let base_url = args
                .base_url
                .clone()
                .unwrap_or_else(|| vgsi::base_url_for_city(&scope_key));
            Ok(Resolved {
                source,
                base_url,
                scope_key,
            })
        }
        "ct_data" => {
            let scope_key = args
                .scope
                .clone()
                .unwrap_or_else(|| ct_data::DEFAULT_SCOPE.to_owned());
            let base_url = args
                .base_url
                .clone()
                .unwrap_or_else(|| config.ct_data_base_url.clone());
            Ok(Resolved {
                source,
                base_url,
                scope_key,
            })
        }
        // create_source rejected everything else already
        other => Err(UsageError(format!("unknown source '{other}'")).into()),
    }
}

/// Build the load-mode entry iterator for a source. Errors before any worker
/// starts when the source's iteration parameters are missing.
pub fn load_iter(
    source_key: &str,
    entry_id_max: Option<i64>,
    datasets: Option<&[String]>,
) -> Result<IterEntriesFn> {
    match source_key {
        "vgsi" => {
            let max = entry_id_max.ok_or_else(|| {
                UsageError("vgsi load requires --entry-id-max".into())
            })?;
            Ok(Box::new(move |_base_url, _data_dir, _scope| {
                Ok((1..=max).map(EntryId::Int).collect())
            }))
        }
        "ct_data" => {
            let ids: Vec<EntryId> = match datasets {
                Some(names) => names
                    .iter()
                    .map(|name| {
                        ct_data::dataset_id(name)
                            .map(|id| EntryId::Str(id.to_owned()))
                            .ok_or_else(|| {
                                anyhow::Error::new(UsageError(format!(
                                    "unknown ct_data dataset '{name}'"
                                )))
                            })
                    })
                    .collect::<Result<_>>()?,
                None => ct_data::DATASETS
                    .iter()
                    .map(|(_, id)| EntryId::Str((*id).to_owned()))
                    .collect(),
            };
            Ok(Box::new(move |_base_url, _data_dir, _scope| Ok(ids)))
        }
        other => Err(UsageError(format!("unknown source '{other}'")).into()),
    }
}

/// Scope keys under `data_dir` that belong to this source, for refresh-all.
/// Attribution is by table layout: a vgsi scope has a `properties` table, a
/// ct_data scope has one of the registry tables.
pub fn scopes_for(source_key: &str, data_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return Vec::new();
    };
    let mut scopes: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('_'))
        .filter(|name| {
            let scope_dir = data_dir.join(name);
            match source_key {
                "vgsi" => scope_dir.join("properties").is_dir(),
                "ct_data" => ct_data::DATASETS
                    .iter()
                    .any(|(table, _)| scope_dir.join(table).is_dir()),
                _ => false,
            }
        })
        .collect();
    scopes.sort();
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_iter_vgsi_requires_entry_id_max() {
        assert!(load_iter("vgsi", None, None).is_err());
        let iter = load_iter("vgsi", Some(3), None).unwrap();
        let ids = iter("https://example.com/", Path::new("data"), "testcity").unwrap();
        assert_eq!(
            ids,
            vec![EntryId::Int(1), EntryId::Int(2), EntryId::Int(3)]
        );
    }

    #[test]
    fn test_load_iter_ct_data_defaults_to_all_datasets() {
        let iter = load_iter("ct_data", None, None).unwrap();
        let ids = iter("https://example.com", Path::new("data"), "scope").unwrap();
        assert_eq!(ids.len(), ct_data::DATASETS.len());
    }

    #[test]
    fn test_load_iter_ct_data_rejects_unknown_dataset() {
        let datasets = vec!["bogus".to_owned()];
        assert!(load_iter("ct_data", None, Some(&datasets)).is_err());
    }

    #[test]
    fn test_scopes_for_attributes_by_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("newhaven/properties")).unwrap();
        std::fs::create_dir_all(dir.path().join("ct_business_registry/businesses")).unwrap();
        std::fs::create_dir_all(dir.path().join("_checkpoints")).unwrap();

        assert_eq!(scopes_for("vgsi", dir.path()), vec!["newhaven"]);
        assert_eq!(
            scopes_for("ct_data", dir.path()),
            vec!["ct_business_registry"]
        );
    }
}
