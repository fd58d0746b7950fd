//! Sliding-window rate limiting with atomic check-and-record
//!
//! Guards externally-facing authentication operations against brute force. The
//! single entry point `check_and_record` decides and records in one indivisible
//! step, so two concurrent callers can never both slip past a separate check
//! before either of them records.
//!
//! Backends:
//! - `MemoryRateLimiter` - one process, mutex-guarded timestamp list per identifier
//! - `RedisRateLimiter` - shared across processes, server-side script over a sorted set
//!
//! `connect` picks the backend at startup and falls back to memory (loudly) when
//! Redis is configured but unreachable.

pub mod backend;
pub mod cleanup;
pub mod distributed;
pub mod error;
pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use backend::connect;
pub use cleanup::spawn_cleanup_task;
pub use distributed::RedisRateLimiter;
pub use error::{Error, Result};
pub use memory::MemoryRateLimiter;

/// Atomic sliding-window limiter shared by every backend.
///
/// Uses `Pin<Box<dyn Future>>` return types so callers can hold `Arc<dyn RateLimiter>`.
pub trait RateLimiter: Send + Sync {
    /// Backend label for logs and health output ("memory", "redis").
    fn backend(&self) -> &'static str;

    /// Check the identifier's attempts in the trailing `window` and record one more
    /// if under `max_attempts`.
    ///
    /// Returns `true` when the caller is limited (nothing recorded), `false` when
    /// the attempt was recorded and may proceed.
    fn check_and_record<'a>(
        &'a self,
        identifier: &'a str,
        max_attempts: u32,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Forget every recorded attempt for the identifier.
    fn clear_attempts<'a>(
        &'a self,
        identifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Drop entries older than `window` across all identifiers. Idempotent.
    ///
    /// Returns the number of entries removed. Backends with native expiry return 0.
    fn cleanup_stale_entries(
        &self,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;

    /// Liveness probe for the backing store.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
