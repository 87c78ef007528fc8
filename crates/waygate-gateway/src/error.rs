//! Gateway error types.

use thiserror::Error;

/// Errors from gateway-side session and endpoint plumbing.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No session with this id exists.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The attach token was missing, malformed, expired, or forged.
    #[error("invalid attach token: {0}")]
    InvalidToken(String),

    /// The session has no attached executor to command.
    #[error("session {0} has no attached executor")]
    NotAttached(String),

    /// Key or signing machinery failed.
    #[error(transparent)]
    Crypto(#[from] waygate_crypto::CryptoError),

    /// Gateway startup failed.
    #[error("startup error: {0}")]
    Startup(String),
}

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
