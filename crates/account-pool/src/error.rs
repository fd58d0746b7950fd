//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("invalid release outcome: {0}")]
    InvalidOutcome(String),

    #[error("resource repository error: {0}")]
    Repository(String),

    #[error("accounts file error: {0}")]
    Seed(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
