//! Compact JWS (JSON Web Signature) with EdDSA.
//!
//! Capsule manifests are signed detached: the manifest JSON (minus `sig`)
//! becomes the payload of a compact `header.payload.signature` token. The
//! header is always `{"alg":"EdDSA"}`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::{KeyPair, verify_with};

/// The protected header used for every signature.
const PROTECTED_HEADER: &str = r#"{"alg":"EdDSA"}"#;

/// Compact JWS operations.
pub struct Jws;

impl Jws {
    /// Sign a payload, producing a compact serialization
    /// `base64url(header).base64url(payload).base64url(signature)`.
    #[must_use]
    pub fn sign(keypair: &KeyPair, payload: &[u8]) -> String {
        let header = B64URL.encode(PROTECTED_HEADER);
        let body = B64URL.encode(payload);
        let signing_input = format!("{header}.{body}");
        let signature = keypair.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", B64URL.encode(signature))
    }

    /// Verify a compact JWS and return the decoded payload.
    ///
    /// # Errors
    ///
    /// [`CryptoError::MalformedJws`] for shape problems,
    /// [`CryptoError::SignatureVerificationFailed`] for a bad signature.
    pub fn verify(public_key: &[u8; 32], token: &str) -> CryptoResult<Vec<u8>> {
        let mut parts = token.split('.');
        let (Some(header), Some(body), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::MalformedJws(
                "expected header.payload.signature".into(),
            ));
        };

        let header_bytes = B64URL
            .decode(header)
            .map_err(|_| CryptoError::MalformedJws("header is not base64url".into()))?;
        let header_json: serde_json::Value = serde_json::from_slice(&header_bytes)
            .map_err(|_| CryptoError::MalformedJws("header is not JSON".into()))?;
        if header_json.get("alg").and_then(serde_json::Value::as_str) != Some("EdDSA") {
            return Err(CryptoError::MalformedJws("unsupported alg".into()));
        }

        let signature = B64URL
            .decode(sig)
            .map_err(|_| CryptoError::MalformedJws("signature is not base64url".into()))?;
        let signing_input = format!("{header}.{body}");
        verify_with(public_key, signing_input.as_bytes(), &signature)?;

        B64URL
            .decode(body)
            .map_err(|_| CryptoError::MalformedJws("payload is not base64url".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let kp = KeyPair::generate();
        let payload = br#"{"version":"1","language":"js"}"#;
        let token = Jws::sign(&kp, payload);

        let recovered = Jws::verify(kp.public_key_bytes(), &token).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn token_has_three_segments() {
        let kp = KeyPair::generate();
        let token = Jws::sign(&kp, b"x");
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn tampered_payload_fails() {
        let kp = KeyPair::generate();
        let token = Jws::sign(&kp, b"original");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = B64URL.encode(b"forged");
        parts[1] = &forged;
        let tampered = parts.join(".");

        assert!(matches!(
            Jws::verify(kp.public_key_bytes(), &tampered),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let token = Jws::sign(&kp, b"payload");
        assert!(Jws::verify(other.public_key_bytes(), &token).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let kp = KeyPair::generate();
        for bad in ["", "a.b", "a.b.c.d", "!!.!!.!!"] {
            assert!(matches!(
                Jws::verify(kp.public_key_bytes(), bad),
                Err(CryptoError::MalformedJws(_))
            ));
        }
    }
}
