//! Redis-backed sliding-window backend shared across process instances
//!
//! Each identifier owns a sorted set `ratelimit:<identifier>` scored by attempt
//! time in unix milliseconds, one unique member per attempt. A Lua script prunes,
//! counts and conditionally appends in a single server-side step, and refreshes
//! the key's TTL so idle identifiers expire on their own.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::{Clock, Secret, SystemClock};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, info};

use crate::RateLimiter;
use crate::error::{Result, validate};

const KEY_PREFIX: &str = "ratelimit:";

/// KEYS[1] = set key; ARGV = now_ms, window_ms, max_attempts, member.
/// Returns 1 when limited, 0 when the attempt was recorded.
const CHECK_AND_RECORD_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max_attempts = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= max_attempts then
  return 1
end
redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
return 0
";

/// Distributed rate limiter over a multiplexed Redis connection.
pub struct RedisRateLimiter {
    connection: MultiplexedConnection,
    script: Script,
    clock: Arc<dyn Clock>,
}

impl RedisRateLimiter {
    /// Open a connection and verify it with a PING.
    pub async fn connect(url: &Secret<String>) -> Result<Self> {
        let client = redis::Client::open(url.expose().as_str())?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await?;
        info!("connected to redis rate limit backend");
        Ok(Self {
            connection,
            script: Script::new(CHECK_AND_RECORD_SCRIPT),
            clock: Arc::new(SystemClock),
        })
    }

    fn key(identifier: &str) -> String {
        format!("{KEY_PREFIX}{identifier}")
    }
}

impl RateLimiter for RedisRateLimiter {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn check_and_record<'a>(
        &'a self,
        identifier: &'a str,
        max_attempts: u32,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            validate(max_attempts, window)?;
            let mut connection = self.connection.clone();
            let now = self.clock.now_millis();
            let member = format!("{now}-{}", uuid::Uuid::new_v4().as_simple());
            let limited: i64 = self
                .script
                .key(Self::key(identifier))
                .arg(now)
                .arg(window.as_millis() as u64)
                .arg(max_attempts)
                .arg(member)
                .invoke_async(&mut connection)
                .await?;
            if limited == 1 {
                debug!(identifier, "rate limited (redis)");
            }
            Ok(limited == 1)
        })
    }

    fn clear_attempts<'a>(
        &'a self,
        identifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            redis::cmd("DEL")
                .arg(Self::key(identifier))
                .query_async::<i64>(&mut connection)
                .await?;
            Ok(())
        })
    }

    fn cleanup_stale_entries(
        &self,
        _window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        // Keys carry a PEXPIRE equal to the window
        Box::pin(async { Ok(0) })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            redis::cmd("PING")
                .query_async::<String>(&mut connection)
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(
            RedisRateLimiter::key("admin-auth:10.0.0.1"),
            "ratelimit:admin-auth:10.0.0.1"
        );
    }

    #[test]
    fn script_prunes_before_counting() {
        let prune = CHECK_AND_RECORD_SCRIPT.find("ZREMRANGEBYSCORE").unwrap();
        let count = CHECK_AND_RECORD_SCRIPT.find("ZCARD").unwrap();
        let append = CHECK_AND_RECORD_SCRIPT.find("ZADD").unwrap();
        assert!(prune < count && count < append);
    }

    #[tokio::test]
    async fn connect_to_unreachable_server_is_unavailable() {
        // Port 1 on loopback is never a redis server
        let url = Secret::from("redis://127.0.0.1:1/");
        let err = RedisRateLimiter::connect(&url).await.err().unwrap();
        assert!(
            matches!(err, crate::Error::Unavailable(_) | crate::Error::Backend(_)),
            "got: {err:?}"
        );
    }

    // The tests below need a live server:
    // REDIS_URL=redis://127.0.0.1:6379 cargo test -p rate-limit -- --ignored

    async fn live_limiter() -> Option<Arc<RedisRateLimiter>> {
        let url = std::env::var("REDIS_URL").ok()?;
        let limiter = RedisRateLimiter::connect(&Secret::from(url.as_str()))
            .await
            .unwrap();
        Some(Arc::new(limiter))
    }

    fn unique_identifier() -> String {
        format!("test:{}", uuid::Uuid::new_v4().as_simple())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    #[ignore = "requires REDIS_URL"]
    async fn redis_concurrent_callers_admit_exactly_max() {
        let Some(limiter) = live_limiter().await else {
            return;
        };
        let identifier = Arc::new(unique_identifier());
        let max = 5u32;
        let extra = 20u32;

        let barrier = Arc::new(tokio::sync::Barrier::new((max + extra) as usize));
        let mut handles = Vec::new();
        for _ in 0..(max + extra) {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            let identifier = identifier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                limiter
                    .check_and_record(&identifier, max, Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if !h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, max);
        limiter.clear_attempts(&identifier).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "requires REDIS_URL"]
    async fn redis_window_slides_and_clear_resets() {
        let Some(limiter) = live_limiter().await else {
            return;
        };
        let identifier = unique_identifier();
        let window = Duration::from_millis(500);

        for _ in 0..3 {
            assert!(!limiter.check_and_record(&identifier, 3, window).await.unwrap());
        }
        assert!(limiter.check_and_record(&identifier, 3, window).await.unwrap());

        // Old attempts fall out of the window and free the slots again.
        tokio::time::sleep(window + Duration::from_millis(100)).await;
        assert!(!limiter.check_and_record(&identifier, 3, window).await.unwrap());

        limiter.clear_attempts(&identifier).await.unwrap();
        for _ in 0..3 {
            assert!(!limiter.check_and_record(&identifier, 3, window).await.unwrap());
        }
        assert!(limiter.check_and_record(&identifier, 3, window).await.unwrap());
        limiter.clear_attempts(&identifier).await.unwrap();
    }
}
