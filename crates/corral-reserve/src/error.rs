//! Error types for corral-reserve.

use thiserror::Error;

/// Result type alias using corral-reserve's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing reservations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file problems.
    #[error("config load failed: {0}")]
    Config(String),

    /// State file could not be locked; another invocation holds it.
    #[error("state lock failed: {0}")]
    Lock(String),

    /// State file parse/serialize failure (empty files are fine).
    #[error("state {operation} failed: {reason}")]
    Store {
        /// The operation that failed ("parse", "write", ...).
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// No reservation by that name.
    #[error("reservation not found: {0}")]
    NotFound(String),

    /// A reservation by that name already exists.
    #[error("reservation already exists: {0}")]
    Exists(String),

    /// The schedule cannot satisfy the request.
    #[error("schedule allocation failed: {0}")]
    Schedule(String),

    /// Request exceeds a non-root policy limit.
    #[error("request denied: {0}")]
    Denied(String),

    /// Node backend (PXE install, power control) failure.
    #[error("backend {operation} failed: {reason}")]
    Backend {
        /// The operation that failed ("install", "power", ...).
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Switch driver failure.
    #[error("network isolation failed: {0}")]
    Network(String),

    /// Command usage error.
    #[error("{0}")]
    Usage(String),

    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a store error.
    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a schedule allocation error.
    pub fn schedule(reason: impl Into<String>) -> Self {
        Self::Schedule(reason.into())
    }

    /// Create a usage error.
    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage(reason.into())
    }
}
