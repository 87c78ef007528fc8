//! Policy error types.

use thiserror::Error;

/// Errors raised by policy enforcement.
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    /// A network request was refused.
    #[error("network denied: {reason}")]
    NetworkDenied {
        /// Why the request was refused.
        reason: String,
    },

    /// A filesystem access was refused.
    #[error("filesystem denied: {access} access to {path}")]
    PathDenied {
        /// The virtual path that was refused.
        path: String,
        /// The access kind that was attempted.
        access: &'static str,
    },

    /// The path could not be interpreted at all.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;
