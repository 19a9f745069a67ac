//! Shared result alias and the errors that cross the engine boundary.

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Errors the orchestrator surfaces to its caller. Everything else (transient
/// scrape failures, batch-write failures, checkpoint failures) is recovered
/// locally and only logged.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The consecutive-error circuit breaker fired; remaining work was
    /// cancelled. Carries the success count so callers can still report it.
    #[error(
        "aborting after {consecutive} consecutive errors ({total} total): \
         likely a systemic issue (network outage, site down, etc.)"
    )]
    TooManyErrors {
        consecutive: u32,
        total: u64,
        completed: u64,
    },
}

/// A mistake in how the tool was invoked (unknown source, missing required
/// argument). Mapped to exit code 1, as opposed to internal failures (2).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);
