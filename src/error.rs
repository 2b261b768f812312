//! Error types for the batch scheduler

use thiserror::Error;

/// Result type for batch scheduler operations
pub type BatchResult<T> = Result<T, BatchError>;

/// Error types surfaced by the batch scheduler
///
/// Anchor-level execution failures are recorded on the anchor itself and are
/// never returned through this type; only configuration problems, fatal parent
/// refresh failures, cancellation, and internal invariant violations are.
#[derive(Error, Debug, Clone)]
pub enum BatchError {
    /// Invalid run configuration
    #[error("Invalid run configuration: {0}")]
    Config(String),

    /// A required collaborator was not provided
    #[error("Collaborator not configured: {0}")]
    CollaboratorMissing(String),

    /// Parent pyramid refresh exhausted its retries
    #[error("Parent refresh failed: {0}")]
    ParentRefresh(String),

    /// The run (or one of its suspend points) was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unknown anchor referenced by id
    #[error("Unknown anchor {0}")]
    UnknownAnchor(String),

    /// Review queue misuse (e.g. resolving with no active item)
    #[error("Review queue error: {0}")]
    Review(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchError {
    /// Whether this error represents cooperative cancellation rather than a
    /// genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BatchError::Cancelled(_))
    }
}
