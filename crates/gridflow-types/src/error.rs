use thiserror::Error;

/// Errors from repository operations (used by trait definitions in gridflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A guarded write found the run leased to someone else.
    #[error("run lease is held by another owner")]
    LeaseLost,
}
