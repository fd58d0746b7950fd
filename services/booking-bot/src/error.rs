//! Service-specific error types

use thiserror::Error;

/// Failures of the loop's side collaborators.
///
/// Session and pool failures keep their own crate errors; these cover what the
/// control loop calls around them, none of which may stop the loop.
#[derive(Error, Debug)]
pub enum Error {
    #[error("alert delivery failed: {0}")]
    Alert(String),

    #[error("health check {name} failed: {reason}")]
    Unhealthy { name: String, reason: String },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
