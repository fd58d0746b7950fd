//! Error types for rate limiter backends

/// Errors from rate limiter operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rate limit backend error: {0}")]
    Backend(String),

    #[error("rate limit backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid rate limit: {0}")]
    InvalidLimit(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Backend(e.to_string())
        }
    }
}

/// Result alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reject limits that can never admit an attempt or never expire one.
pub(crate) fn validate(max_attempts: u32, window: std::time::Duration) -> Result<()> {
    if max_attempts == 0 {
        return Err(Error::InvalidLimit("max_attempts must be greater than 0".into()));
    }
    if window.is_zero() {
        return Err(Error::InvalidLimit("window must be greater than 0".into()));
    }
    Ok(())
}
