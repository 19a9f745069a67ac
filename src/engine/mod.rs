//! Generic concurrent scraping engine.
//!
//! Drives pluggable sources through a bounded worker pool with rate limiting,
//! batched parquet writes, JSON checkpointing with mid-run resume, and a
//! consecutive-error circuit breaker. Contains zero source-specific code; all
//! source behavior arrives through the [`Source`] contract.

pub mod rate_limiter;
pub mod row;
pub mod source;
pub mod writer;

pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use source::{EntryId, PhotoItem, ScrapeError, Source, TableRows};
pub use writer::{ParquetWriter, WriteStats};

use crate::error::{EngineError, Result};
use futures::future::join_all;
use num_format::{Locale, ToFormattedString};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

/// Emit a progress line every this many completions when progress is on.
const PROGRESS_EVERY: usize = 25;

/// Produces the entry IDs for a load run: `(base_url, data_dir, scope_key)`.
pub type IterEntriesFn =
    Box<dyn FnOnce(&str, &Path, &str) -> Result<Vec<EntryId>> + Send>;

/// Options shared by load and refresh runs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_workers: usize,
    pub requests_per_second: f64,
    pub batch_size: usize,
    pub show_progress: bool,
    pub download_photos: bool,
    pub photo_dir: PathBuf,
    /// Abort after this many consecutive non-invalid errors; `0` disables.
    pub max_consecutive_errors: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_workers: 10,
            requests_per_second: 5.0,
            batch_size: 10,
            show_progress: true,
            download_photos: false,
            photo_dir: PathBuf::from("photos"),
            max_consecutive_errors: 50,
        }
    }
}

/// Load-mode options on top of [`RunOptions`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub run: RunOptions,
    /// Save a checkpoint every N successful entries.
    pub checkpoint_every: u64,
    pub resume_from_checkpoint: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            run: RunOptions::default(),
            checkpoint_every: 100,
            resume_from_checkpoint: true,
        }
    }
}

enum WorkOutcome {
    Success(Value),
    Invalid,
    Error,
}

struct DriveOutcome {
    completed: u64,
    invalid: u64,
    errors_total: u64,
    consecutive: u32,
    aborted: bool,
}

struct CheckpointPolicy {
    every: u64,
    resumed: u64,
}

/// Scrape entries in parallel, appending results to the scope's files.
///
/// Returns the number of entries successfully scraped. When the circuit
/// breaker fires, the tail batch is still flushed, the final checkpoint still
/// saved, and the session still compacted before
/// [`EngineError::TooManyErrors`] is returned.
pub async fn run_load(
    scope_key: &str,
    writer: Arc<ParquetWriter>,
    source: Arc<dyn Source>,
    base_url: &str,
    iter_entries: IterEntriesFn,
    opts: LoadOptions,
) -> Result<u64> {
    let mut entry_ids = iter_entries(base_url, writer.data_dir(), scope_key)?;
    if entry_ids.is_empty() {
        warn!(scope_key, "no entry IDs to scrape");
        writer.close();
        return Ok(0);
    }

    info!(
        scope_key,
        entries = entry_ids.len(),
        workers = opts.run.max_workers,
        rate = opts.run.requests_per_second,
        "starting parallel scrape"
    );

    // Resume: drop everything up to and including the checkpointed entry
    let mut resumed = 0u64;
    if opts.resume_from_checkpoint {
        let (last_entry_id, total_scraped) = writer.last_checkpoint(scope_key);
        if let Some(last_entry_id) = last_entry_id {
            match entry_ids.iter().position(|id| id.to_string() == last_entry_id) {
                Some(index) => {
                    entry_ids.drain(..=index);
                    resumed = total_scraped;
                    info!(
                        scope_key,
                        last_entry_id = %last_entry_id,
                        previously_scraped = resumed,
                        remaining = entry_ids.len(),
                        "resuming from checkpoint"
                    );
                }
                None => {
                    warn!(
                        scope_key,
                        last_entry_id = %last_entry_id,
                        "checkpoint entry not in current entry list, starting from beginning"
                    );
                }
            }
        }
    }

    if entry_ids.is_empty() {
        info!(scope_key, "all entries already scraped, nothing to do");
        writer.close();
        return Ok(0);
    }

    let total_entries = entry_ids.len();
    let final_anchor = entry_ids.last().cloned();
    let started = Instant::now();

    let outcome = drive_entries(
        scope_key,
        &writer,
        &source,
        base_url,
        entry_ids,
        &opts.run,
        Some(CheckpointPolicy {
            every: opts.checkpoint_every,
            resumed,
        }),
    )
    .await;

    // Final checkpoint, anchored at the last entry the run was asked to cover
    if let Some(anchor) = final_anchor {
        save_checkpoint_logged(&writer, scope_key, &anchor, outcome.completed + resumed).await;
    }

    compact_and_close(&writer).await;

    let elapsed = started.elapsed();
    info!(
        scope_key,
        entries = total_entries,
        success = %outcome.completed.to_formatted_string(&Locale::en),
        invalid = outcome.invalid,
        errors = outcome.errors_total,
        rate_per_sec = %format_rate(outcome.completed, elapsed.as_secs_f64()),
        "scrape complete"
    );

    if outcome.aborted {
        return Err(EngineError::TooManyErrors {
            consecutive: outcome.consecutive,
            total: outcome.errors_total,
            completed: outcome.completed,
        }
        .into());
    }
    Ok(outcome.completed)
}

/// Re-scrape every known entry of a scope to detect and record changes.
///
/// Preloads the hash cache first so writes are change-only; refresh has no
/// resumption semantics and saves no checkpoints.
pub async fn run_refresh(
    scope_key: &str,
    writer: Arc<ParquetWriter>,
    source: Arc<dyn Source>,
    base_url: &str,
    opts: RunOptions,
) -> Result<u64> {
    info!(scope_key, "starting refresh scrape");

    let entry_ids = {
        let writer = Arc::clone(&writer);
        task::spawn_blocking(move || writer.known_entry_ids()).await??
    };
    if entry_ids.is_empty() {
        warn!(scope_key, "no known entries, nothing to refresh");
        writer.close();
        return Ok(0);
    }

    info!(
        scope_key,
        entries = entry_ids.len(),
        base_url,
        workers = opts.max_workers,
        rate = opts.requests_per_second,
        "refreshing known entries"
    );

    {
        let writer = Arc::clone(&writer);
        task::spawn_blocking(move || writer.preload_hashes()).await??;
    }

    let total_entries = entry_ids.len();
    let started = Instant::now();

    let outcome = drive_entries(scope_key, &writer, &source, base_url, entry_ids, &opts, None)
        .await;

    compact_and_close(&writer).await;

    let stats = writer.stats();
    let elapsed = started.elapsed();
    info!(
        scope_key,
        entries = total_entries,
        success = %outcome.completed.to_formatted_string(&Locale::en),
        errors = outcome.errors_total,
        rows_written = stats.rows_written,
        rows_skipped = stats.rows_skipped,
        rate_per_sec = %format_rate(outcome.completed, elapsed.as_secs_f64()),
        "refresh complete"
    );

    if outcome.aborted {
        return Err(EngineError::TooManyErrors {
            consecutive: outcome.consecutive,
            total: outcome.errors_total,
            completed: outcome.completed,
        }
        .into());
    }
    Ok(outcome.completed)
}

/// The shared worker/batch/checkpoint loop.
///
/// A fixed pool of `max_workers` spawned tasks pulls entry IDs from a shared
/// queue and sends results back over a channel; this loop consumes them in
/// completion order, so batching and counters need no locks. When the circuit
/// breaker fires the queue is cleared and the channel closed: in-flight
/// workers finish their current entry and exit. The pool is joined before
/// returning.
async fn drive_entries(
    scope_key: &str,
    writer: &Arc<ParquetWriter>,
    source: &Arc<dyn Source>,
    base_url: &str,
    entry_ids: Vec<EntryId>,
    opts: &RunOptions,
    checkpoint: Option<CheckpointPolicy>,
) -> DriveOutcome {
    let limiter = Arc::new(RateLimiter::new(
        opts.max_workers,
        opts.requests_per_second,
    ));
    let total_entries = entry_ids.len();
    let download_photos = opts.download_photos && source.photo_support();

    let queue = Arc::new(Mutex::new(VecDeque::from(entry_ids)));
    let (result_tx, mut result_rx) =
        mpsc::channel::<(EntryId, WorkOutcome)>(opts.max_workers.max(1));

    let mut handles = Vec::with_capacity(opts.max_workers);
    for worker_id in 0..opts.max_workers {
        let queue = Arc::clone(&queue);
        let results = result_tx.clone();
        let source = Arc::clone(source);
        let limiter = Arc::clone(&limiter);
        let base_url = base_url.to_owned();
        let scope_key = scope_key.to_owned();
        let photo_dir = opts.photo_dir.clone();
        handles.push(tokio::spawn(async move {
            debug!(worker_id, "worker started");
            loop {
                // pop in its own statement so the queue lock is not held
                // while scraping
                let next = lock_queue(&queue).pop_front();
                let Some(entry_id) = next else { break };
                let outcome = scrape_one(
                    &source,
                    &limiter,
                    &base_url,
                    &scope_key,
                    &entry_id,
                    download_photos,
                    &photo_dir,
                )
                .await;
                // a closed channel means the run is aborting
                if results.send((entry_id, outcome)).await.is_err() {
                    break;
                }
            }
            debug!(worker_id, "worker finished");
        }));
    }
    drop(result_tx);

    let mut batch: Vec<Value> = Vec::with_capacity(opts.batch_size);
    let mut completed = 0u64;
    let mut invalid = 0u64;
    let mut errors_total = 0u64;
    let mut consecutive = 0u32;
    let mut processed = 0usize;
    let mut aborted = false;

    while let Some((entry_id, outcome)) = result_rx.recv().await {
        processed += 1;
        match outcome {
            WorkOutcome::Error => {
                errors_total += 1;
                consecutive += 1;
                if opts.max_consecutive_errors > 0 && consecutive >= opts.max_consecutive_errors {
                    error!(
                        scope_key,
                        consecutive,
                        total = errors_total,
                        "too many consecutive errors, cancelling remaining work"
                    );
                    aborted = true;
                    lock_queue(&queue).clear();
                    break;
                }
            }
            WorkOutcome::Invalid => {
                consecutive = 0;
                invalid += 1;
            }
            WorkOutcome::Success(result) => {
                consecutive = 0;
                batch.push(result);
                if batch.len() >= opts.batch_size {
                    flush_batch(writer, &mut batch).await;
                }
                completed += 1;
                if let Some(policy) = &checkpoint {
                    if policy.every > 0 && completed % policy.every == 0 {
                        save_checkpoint_logged(
                            writer,
                            scope_key,
                            &entry_id,
                            completed + policy.resumed,
                        )
                        .await;
                    }
                }
            }
        }

        if opts.show_progress && processed % PROGRESS_EVERY == 0 {
            info!(
                scope_key,
                processed,
                total = total_entries,
                success = completed,
                errors = errors_total,
                "progress"
            );
        }
    }
    drop(result_rx);

    // in-flight workers run their current entry to completion, then exit
    let joined = join_all(handles).await;
    let panicked = joined.iter().filter(|result| result.is_err()).count();
    if panicked > 0 {
        warn!(count = panicked, "worker task(s) panicked");
    }

    flush_batch(writer, &mut batch).await;

    DriveOutcome {
        completed,
        invalid,
        errors_total,
        consecutive,
        aborted,
    }
}

fn lock_queue(queue: &Mutex<VecDeque<EntryId>>) -> MutexGuard<'_, VecDeque<EntryId>> {
    queue
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One worker: take a rate-limit lease, scrape, optionally dispatch photo
/// downloads inside the same lease. The lease is released on every exit path.
async fn scrape_one(
    source: &Arc<dyn Source>,
    limiter: &RateLimiter,
    base_url: &str,
    scope_key: &str,
    entry_id: &EntryId,
    download_photos: bool,
    photo_dir: &Path,
) -> WorkOutcome {
    let _permit = match limiter.acquire().await {
        Ok(permit) => permit,
        Err(err) => {
            error!(entry_id = %entry_id, error = ?err, "failed to acquire rate limit lease");
            return WorkOutcome::Error;
        }
    };

    match source.scrape(base_url, entry_id).await {
        Ok(result) => {
            if download_photos {
                for item in source.photo_items(&result, scope_key, entry_id) {
                    // download failures are never scrape errors
                    let _ = source.download(&item, photo_dir).await;
                }
            }
            WorkOutcome::Success(result)
        }
        Err(ScrapeError::InvalidEntry(_)) => WorkOutcome::Invalid,
        Err(ScrapeError::Failed(err)) => {
            error!(entry_id = %entry_id, error = ?err, "failed to scrape entry");
            WorkOutcome::Error
        }
    }
}

/// Write the accumulated batch and clear it. Failures are logged and
/// swallowed so transient disk issues never lose scrape progress.
async fn flush_batch(writer: &Arc<ParquetWriter>, batch: &mut Vec<Value>) {
    if batch.is_empty() {
        return;
    }
    let results = std::mem::take(batch);
    let writer = Arc::clone(writer);
    match task::spawn_blocking(move || writer.write_batch(&results)).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(?error, "batch write failed"),
        Err(error) => error!(?error, "batch write task panicked"),
    }
}

/// Save a checkpoint, logging failures instead of propagating them.
async fn save_checkpoint_logged(
    writer: &Arc<ParquetWriter>,
    scope_key: &str,
    entry_id: &EntryId,
    total_scraped: u64,
) {
    let writer = Arc::clone(writer);
    let scope_key = scope_key.to_owned();
    let entry_id = entry_id.clone();
    match task::spawn_blocking(move || {
        writer.save_checkpoint(&scope_key, &entry_id, total_scraped)
    })
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(?error, "checkpoint save failed"),
        Err(error) => error!(?error, "checkpoint task panicked"),
    }
}

async fn compact_and_close(writer: &Arc<ParquetWriter>) {
    let compact_writer = Arc::clone(writer);
    if let Err(error) = task::spawn_blocking(move || compact_writer.compact()).await {
        error!(?error, "compaction task panicked");
    }
    writer.close();
}

fn format_rate(completed: u64, elapsed_secs: f64) -> String {
    if elapsed_secs > 0.0 {
        format!("{:.1}", completed as f64 / elapsed_secs)
    } else {
        "n/a".to_owned()
    }
}
