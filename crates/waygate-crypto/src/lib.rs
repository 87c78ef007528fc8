//! Key material and manifest signing for the gateway.
//!
//! One Ed25519 keypair is generated on first run and reused afterwards; it
//! signs capsule manifests (as compact JWS, `alg: EdDSA`) and session
//! attach tokens. Verification is available but stays off the hot path:
//! the capsule cache is already bound by content address.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Crypto error types.
pub mod error;
/// Compact JWS signing and verification.
pub mod jws;
/// Keypair lifecycle and on-disk key store.
pub mod keypair;

pub use error::{CryptoError, CryptoResult};
pub use jws::Jws;
pub use keypair::KeyPair;
