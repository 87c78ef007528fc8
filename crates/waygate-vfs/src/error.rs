//! Virtual filesystem error types.

use thiserror::Error;
use waygate_policy::PolicyError;

/// Errors from sandboxed filesystem operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The path resolved outside the sandbox base.
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    /// The policy refused the access.
    #[error(transparent)]
    Denied(#[from] PolicyError),

    /// The target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// `create` mode was used but the target exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A read exceeded its `max_bytes` option.
    #[error("size limit exceeded reading {path}: more than {max_bytes} bytes")]
    SizeLimit {
        /// The virtual path being read.
        path: String,
        /// The configured limit.
        max_bytes: u64,
    },

    /// UTF-8 decoding was requested but the bytes are not UTF-8.
    #[error("not valid utf-8: {0}")]
    NotUtf8(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for VFS operations.
pub type VfsResult<T> = Result<T, VfsError>;
