use thiserror::Error;

/// Crate-wide error type. Variants mirror the error-kind taxonomy used
/// throughout the write/read pipeline so that a caller can match on kind
/// without inspecting message text.
#[derive(Debug, Error)]
pub enum EntDbError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("transaction error: {0}")]
    TransactionError(String),

    #[error("schema compatibility error: {0}")]
    SchemaCompatError(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl EntDbError {
    /// Whether a client should treat this failure as safe to retry with
    /// backoff, per the "retryable errors are marked" contract.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EntDbError::Connection(_) | EntDbError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, EntDbError>;
