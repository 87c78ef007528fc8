//! Capsule error types.

use thiserror::Error;
use waygate_core::CapsuleHash;

/// Errors from capsule building and loading.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// The run request was malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The bundler or a mount build failed.
    #[error("dependency resolution failed: {0}")]
    DepsResolutionFailed(String),

    /// Signing failed.
    #[error("signer error: {0}")]
    Signer(#[from] waygate_crypto::CryptoError),

    /// A manifest could not be (de)serialized.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// No capsule with this hash is cached.
    #[error("capsule not found: {0}")]
    NotFound(CapsuleHash),

    /// A layer archive was missing or malformed.
    #[error("layer error: {0}")]
    Layer(String),

    /// Cache directory I/O failed.
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for capsule operations.
pub type CapsuleResult<T> = Result<T, CapsuleError>;
