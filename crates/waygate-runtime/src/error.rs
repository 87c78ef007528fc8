//! Runtime error types.
//!
//! Guest faults never surface here: they become exit codes and stderr on
//! the run outcome. These errors are infrastructure failures only.

use thiserror::Error;

/// Errors from setting up or tearing down a sandboxed run.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The capsule could not be loaded or materialized.
    #[error(transparent)]
    Capsule(#[from] waygate_capsule::CapsuleError),

    /// The work root could not be prepared.
    #[error(transparent)]
    Vfs(#[from] waygate_vfs::VfsError),

    /// The embedded engine failed outside guest code.
    #[error("engine error: {0}")]
    Engine(String),

    /// Work directory I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl From<rquickjs::Error> for RuntimeError {
    fn from(err: rquickjs::Error) -> Self {
        Self::Engine(err.to_string())
    }
}
