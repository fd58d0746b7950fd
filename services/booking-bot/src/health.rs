//! Shared-dependency health checks run at the top of each loop iteration

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rate_limit::RateLimiter;

use crate::error::{Error, Result};

pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Pings the rate-limit backend.
pub struct RateLimiterHealth {
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimiterHealth {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl HealthCheck for RateLimiterHealth {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.limiter.ping().await.map_err(|e| Error::Unhealthy {
                name: format!("rate-limit ({})", self.limiter.backend()),
                reason: e.to_string(),
            })
        })
    }
}
