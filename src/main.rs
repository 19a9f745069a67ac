use clap::Parser;
use figment::{Figment, providers::Env};
use harvest::cli::{Cli, Command, SharedArgs, SourceArgs};
use harvest::config::Config;
use harvest::engine::{self, LoadOptions, ParquetWriter, RunOptions};
use harvest::error::{EngineError, UsageError};
use harvest::{logging, sources};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config: Config = match Figment::new().merge(Env::prefixed("HARVEST_")).extract() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            std::process::exit(1);
        }
    };

    logging::setup_logging(&config, cli.tracing);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting harvest"
    );

    let exit_code = match run(cli.command, &config).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(usage) = err.downcast_ref::<UsageError>() {
                eprintln!("Error: {usage}");
                1
            } else if let Some(engine_err) = err.downcast_ref::<EngineError>() {
                error!(error = %engine_err, "run aborted");
                2
            } else {
                error!(error = ?err, "fatal error");
                2
            }
        }
    };

    info!(exit_code, "shutdown complete");
    std::process::exit(exit_code);
}

async fn run(command: Command, config: &Config) -> anyhow::Result<i32> {
    match command {
        Command::Load {
            target,
            shared,
            checkpoint_every,
            no_resume,
            entry_id_max,
            datasets,
        } => {
            let resolved = sources::resolve(&target, config)?;
            let iter = sources::load_iter(&target.source, entry_id_max, datasets.as_deref())?;
            let writer = Arc::new(ParquetWriter::new(
                &resolved.scope_key,
                Arc::clone(&resolved.source),
                &data_dir(&shared, config),
            ));
            let opts = LoadOptions {
                run: run_options(&shared, config),
                checkpoint_every,
                resume_from_checkpoint: !no_resume,
            };
            let count = engine::run_load(
                &resolved.scope_key,
                writer,
                resolved.source,
                &resolved.base_url,
                iter,
                opts,
            )
            .await?;
            println!("Done! Loaded {count} entries for {}", resolved.scope_key);
            Ok(0)
        }
        Command::Refresh { target, shared } => {
            let (scope_key, count) = refresh_one(&target, &shared, config).await?;
            println!("Done! Refreshed {count} entries for {scope_key}");
            Ok(0)
        }
        Command::RefreshAll { shared } => {
            let data_dir = data_dir(&shared, config);
            let mut failures = 0u32;
            let mut total = 0u64;

            for source_key in sources::SOURCE_KEYS {
                let scopes = sources::scopes_for(source_key, &data_dir);
                if scopes.is_empty() {
                    info!(source = source_key, "no data found for source, skipping");
                    continue;
                }
                for scope in scopes {
                    let target = SourceArgs {
                        source: (*source_key).to_owned(),
                        scope: Some(scope.clone()),
                        base_url: None,
                    };
                    match refresh_one(&target, &shared, config).await {
                        Ok((_, count)) => total += count,
                        Err(err) => {
                            error!(
                                source = source_key,
                                scope = %scope,
                                error = ?err,
                                "refresh failed"
                            );
                            failures += 1;
                        }
                    }
                }
            }

            println!("Refresh-all complete: {total} entries refreshed, {failures} failures");
            Ok(if failures > 0 { 1 } else { 0 })
        }
    }
}

async fn refresh_one(
    target: &SourceArgs,
    shared: &SharedArgs,
    config: &Config,
) -> anyhow::Result<(String, u64)> {
    let resolved = sources::resolve(target, config)?;
    let writer = Arc::new(ParquetWriter::new(
        &resolved.scope_key,
        Arc::clone(&resolved.source),
        &data_dir(shared, config),
    ));
    let count = engine::run_refresh(
        &resolved.scope_key,
        writer,
        resolved.source,
        &resolved.base_url,
        run_options(shared, config),
    )
    .await?;
    Ok((resolved.scope_key, count))
}

fn data_dir(shared: &SharedArgs, config: &Config) -> PathBuf {
    shared
        .data_dir
        .clone()
        .unwrap_or_else(|| config.data_dir.clone())
}

fn run_options(shared: &SharedArgs, config: &Config) -> RunOptions {
    RunOptions {
        max_workers: shared.workers,
        requests_per_second: shared.rate,
        batch_size: shared.batch_size,
        show_progress: !shared.quiet,
        download_photos: shared.download_photos,
        photo_dir: shared
            .photo_dir
            .clone()
            .unwrap_or_else(|| config.photo_dir.clone()),
        max_consecutive_errors: shared.max_consecutive_errors,
    }
}
