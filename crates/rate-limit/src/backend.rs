//! Startup-time backend selection
//!
//! Redis is used whenever a URL is configured. If it cannot be reached at
//! startup the process still comes up on the in-memory backend, but the
//! downgrade is logged at error level and counted, because limits are then no
//! longer shared between instances.

use std::sync::Arc;

use common::Secret;
use tracing::{error, info};

use crate::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};

/// Build the rate limiter for this process.
pub async fn connect(redis_url: Option<&Secret<String>>) -> Arc<dyn RateLimiter> {
    let Some(url) = redis_url else {
        info!("no redis url configured, using in-memory rate limiter (single instance only)");
        return Arc::new(MemoryRateLimiter::new());
    };

    match RedisRateLimiter::connect(url).await {
        Ok(limiter) => Arc::new(limiter),
        Err(e) => {
            error!(
                error = %e,
                "redis rate limit backend unreachable, FALLING BACK to in-memory limiter; \
                 limits are NOT shared across instances"
            );
            metrics::counter!("rate_limit_backend_failover_total").increment(1);
            Arc::new(MemoryRateLimiter::new())
        }
    }
}
