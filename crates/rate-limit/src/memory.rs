//! Single-process sliding-window backend
//!
//! One `VecDeque` of attempt timestamps per identifier behind a std `Mutex`. The
//! lock is held across prune, count and append, which is what makes
//! `check_and_record` atomic within the process. No await happens under the lock.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{Clock, SystemClock};
use tracing::debug;

use crate::RateLimiter;
use crate::error::{Result, validate};

/// In-memory rate limiter. Limits are NOT shared across process instances.
pub struct MemoryRateLimiter {
    attempts: Mutex<HashMap<String, VecDeque<u64>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Synchronous core of `check_and_record`.
    fn check_and_record_now(&self, identifier: &str, max_attempts: u32, window: Duration) -> bool {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(window.as_millis() as u64);

        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = attempts.entry(identifier.to_string()).or_default();
        while entries.front().is_some_and(|&t| t <= cutoff) {
            entries.pop_front();
        }

        if entries.len() >= max_attempts as usize {
            debug!(identifier, attempts = entries.len(), "rate limited");
            return true;
        }
        entries.push_back(now);
        false
    }

    fn cleanup_now(&self, window: Duration) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(window.as_millis() as u64);
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0usize;
        attempts.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|&t| t > cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Number of identifiers currently tracked.
    pub fn tracked_identifiers(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn check_and_record<'a>(
        &'a self,
        identifier: &'a str,
        max_attempts: u32,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            validate(max_attempts, window)?;
            Ok(self.check_and_record_now(identifier, max_attempts, window))
        })
    }

    fn clear_attempts<'a>(
        &'a self,
        identifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(identifier);
            Ok(())
        })
    }

    fn cleanup_stale_entries(
        &self,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move { Ok(self.cleanup_now(window)) })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
