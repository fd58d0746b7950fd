//! Error types for session collaborators and orchestration

/// Errors raised by session collaborators or the orchestrator itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("work repository error: {0}")]
    WorkRepository(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("task processor error: {0}")]
    Processor(String),

    #[error(transparent)]
    Pool(#[from] account_pool::Error),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
