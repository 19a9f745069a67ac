//! Concurrency and pacing control for outbound scrape requests.
//!
//! Two independent knobs: a counting semaphore bounds how many requests are
//! in flight, and a minimum inter-request interval spreads them out so N
//! workers converge on an actual requests-per-second ceiling instead of
//! bursting whenever permits free up.

use crate::error::Result;
use anyhow::Context;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Waiting longer than this for a permit means the pool is wedged.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cumulative counters, observational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_wait: Duration,
}

struct PacerState {
    /// The instant the most recently admitted request was scheduled for.
    /// Reserved *before* the admitted task sleeps, so concurrent acquirers
    /// compute their wait from the already-claimed slot.
    last_slot: Option<Instant>,
    total_requests: u64,
    total_wait: Duration,
}

pub struct RateLimiter {
    semaphore: Semaphore,
    min_interval: Duration,
    state: Mutex<PacerState>,
}

/// A held lease. Dropping it releases the concurrency slot on every exit
/// path, including cancellation.
pub struct RatePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl RateLimiter {
    /// `requests_per_second == 0` disables spacing; only `max_workers` caps
    /// concurrency.
    pub fn new(max_workers: usize, requests_per_second: f64) -> Self {
        let min_interval = if requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            semaphore: Semaphore::new(max_workers.max(1)),
            min_interval,
            state: Mutex::new(PacerState {
                last_slot: None,
                total_requests: 0,
                total_wait: Duration::ZERO,
            }),
        }
    }

    /// Acquire a lease, blocking on both the concurrency cap and the pacing
    /// interval. Errors if no permit frees up within the hard timeout.
    pub async fn acquire(&self) -> Result<RatePermit<'_>> {
        let permit = tokio::time::timeout(ACQUIRE_TIMEOUT, self.semaphore.acquire())
            .await
            .context("rate limiter semaphore timed out after 300s")?
            .context("rate limiter semaphore closed")?;

        if self.min_interval.is_zero() {
            let mut state = self.lock_state();
            state.total_requests += 1;
        } else {
            let wait = {
                let mut state = self.lock_state();
                let now = Instant::now();
                let wait = match state.last_slot {
                    Some(last) => {
                        self.min_interval.saturating_sub(now.duration_since(last))
                    }
                    None => Duration::ZERO,
                };
                state.last_slot = Some(now + wait);
                state.total_requests += 1;
                wait
            };
            // Sleep outside the lock so other workers can claim their slots
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
                let mut state = self.lock_state();
                state.total_wait += wait;
            }
        }

        Ok(RatePermit { _permit: permit })
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.lock_state();
        RateLimiterStats {
            total_requests: state.total_requests,
            total_wait: state.total_wait,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PacerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::new(2, 10.0);
        let start = Instant::now();
        let _permit = limiter.acquire().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_enforces_minimum_interval() {
        // 2 rps = 500ms interval; three back-to-back leases mean the third
        // starts at least ~1s after the first.
        let limiter = RateLimiter::new(5, 2.0);
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "elapsed {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_are_paced() {
        let limiter = Arc::new(RateLimiter::new(5, 2.0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "elapsed {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_semaphore_bounds_concurrency() {
        let limiter = Arc::new(RateLimiter::new(2, 0.0));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_zero_rps_disables_spacing() {
        let limiter = RateLimiter::new(5, 0.0);
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_stats_count_requests() {
        let limiter = RateLimiter::new(5, 10.0);
        for _ in 0..5 {
            let _permit = limiter.acquire().await.unwrap();
        }
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 5);
    }
}
