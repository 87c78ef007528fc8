//! Crypto error types.

use thiserror::Error;

/// Errors from key handling and signing.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// A signature had the wrong length.
    #[error("invalid signature length: expected {expected} bytes, got {actual}")]
    InvalidSignatureLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// Base64 decoding failed.
    #[error("invalid base64 encoding")]
    InvalidBase64Encoding,

    /// A compact JWS did not have the `header.payload.signature` shape.
    #[error("malformed JWS: {0}")]
    MalformedJws(String),

    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Key store I/O failed.
    #[error("key store error: {0}")]
    KeyStore(String),
}

/// Result alias for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
