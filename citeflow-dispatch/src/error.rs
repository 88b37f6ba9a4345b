//! Error types for the dispatch engine
//!
//! Per-service failures never surface here: they are recorded on the
//! dispatch record by the tier executor. These errors are the ones that
//! abort a whole dispatch call.

use thiserror::Error;
use uuid::Uuid;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Persistence failure outside of a claim
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Services could not be claimed atomically; nothing was executed
    #[error("Failed to claim services for request {request_id}: {reason}")]
    ClaimFailed { request_id: Uuid, reason: String },

    /// Pass task ended before reporting its foreground tiers
    #[error("Dispatch worker stopped before reporting for request {0}")]
    WorkerLost(Uuid),

    /// No request with this identifier exists
    #[error("Request not found: {0}")]
    RequestNotFound(Uuid),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Shared error from citeflow-common
    #[error(transparent)]
    Common(#[from] citeflow_common::Error),
}
