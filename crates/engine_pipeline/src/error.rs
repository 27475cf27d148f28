//! Scheduler error types.

/// Errors returned by world and pipeline operations.
///
/// Internal invariant violations (a cursor out of bounds, a freshly reset
/// write tracker requesting another merge) are not represented here; they
/// panic.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The operation is not allowed in the world's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// An argument does not refer to something valid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A required OS primitive is not available.
    #[error("missing OS API: {0}")]
    MissingOsApi(&'static str),

    /// An OS primitive failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A world configuration document could not be parsed.
    #[error("invalid world config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
