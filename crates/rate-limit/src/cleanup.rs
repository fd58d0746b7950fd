//! Periodic maintenance for backends without native expiry
//!
//! The in-memory backend only prunes an identifier when that identifier is
//! checked again, so identifiers that never come back would accumulate. A
//! background task sweeps them on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::RateLimiter;

/// Spawn a task that calls `cleanup_stale_entries(window)` every `interval`.
///
/// Returns a `JoinHandle` for the spawned task; abort it on shutdown.
pub fn spawn_cleanup_task(
    limiter: Arc<dyn RateLimiter>,
    interval: Duration,
    window: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, nothing is stale yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            cleanup_cycle(limiter.as_ref(), window).await;
        }
    })
}

async fn cleanup_cycle(limiter: &dyn RateLimiter, window: Duration) {
    match limiter.cleanup_stale_entries(window).await {
        Ok(0) => {}
        Ok(removed) => {
            debug!(backend = limiter.backend(), removed, "pruned stale rate limit entries")
        }
        Err(e) => warn!(
            backend = limiter.backend(),
            error = %e,
            "rate limit cleanup failed, will retry next cycle"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRateLimiter;
    use common::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_prunes_on_interval() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let memory = Arc::new(MemoryRateLimiter::with_clock(clock.clone()));
        let window = Duration::from_secs(60);
        memory.check_and_record("idle", 3, window).await.unwrap();
        clock.advance(Duration::from_secs(120));

        let handle = spawn_cleanup_task(memory.clone(), Duration::from_secs(30), window);
        tokio::time::sleep(Duration::from_secs(31)).await;
        // Let the spawned task run its cycle
        tokio::task::yield_now().await;

        assert_eq!(memory.tracked_identifiers(), 0);
        handle.abort();
    }
}
