//! Ed25519 keypair lifecycle.
//!
//! The private key lives at `<dir>/signing.key` as a base64 text file with
//! 0o600 permissions; the public key is written next to it as
//! `signing.pub`. The seed is zeroized on drop.

use std::io::Write;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};

/// File name of the private signing key inside the key directory.
pub const PRIVATE_KEY_FILE: &str = "signing.key";
/// File name of the public key inside the key directory.
pub const PUBLIC_KEY_FILE: &str = "signing.pub";

/// An Ed25519 keypair with secure memory handling.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)] // VerifyingKey does not implement Zeroize
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    /// Reconstruct from a 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_seed(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        seed.zeroize();
        Ok(Self {
            verifying_key,
            signing_key,
        })
    }

    /// The public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// Public key as base64 text, the form stored in `signing.pub`.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// Short fingerprint: first 8 bytes of SHA-256 over the encoded public
    /// key, hex. Reported once at startup so operators can recognize the
    /// key without seeing it.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public_key_base64().as_bytes());
        hex::encode(&digest[..8])
    }

    /// Sign a message, returning the raw 64-byte signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature made by this keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerificationFailed`] on mismatch.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        verify_with(self.public_key_bytes(), message, signature)
    }

    /// Load the keypair from `dir`, generating and persisting a fresh one
    /// on first run.
    ///
    /// Creation is atomic (`O_CREAT | O_EXCL`, mode 0o600 on Unix) and the
    /// read path refuses symlinked key files.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyStore`] on I/O failures or
    /// [`CryptoError::InvalidBase64Encoding`] /
    /// [`CryptoError::InvalidKeyLength`] for corrupt key files.
    pub fn load_or_generate(dir: impl AsRef<Path>) -> CryptoResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| CryptoError::KeyStore(e.to_string()))?;
        let key_path = dir.join(PRIVATE_KEY_FILE);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&key_path)
            {
                Ok(mut file) => {
                    let kp = Self::generate();
                    let mut seed = Zeroizing::new(kp.signing_key.to_bytes());
                    let encoded = Zeroizing::new(BASE64.encode(seed.as_ref()));
                    file.write_all(encoded.as_bytes())
                        .map_err(|e| CryptoError::KeyStore(e.to_string()))?;
                    seed.zeroize();
                    kp.write_public_key(dir)?;
                    tracing::info!(fingerprint = %kp.fingerprint(), "generated signing key");
                    return Ok(kp);
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
                Err(e) => return Err(CryptoError::KeyStore(e.to_string())),
            }
        }

        #[cfg(not(unix))]
        if !key_path.exists() {
            let kp = Self::generate();
            let seed = Zeroizing::new(kp.signing_key.to_bytes());
            std::fs::write(&key_path, BASE64.encode(seed.as_ref()))
                .map_err(|e| CryptoError::KeyStore(e.to_string()))?;
            kp.write_public_key(dir)?;
            tracing::info!(fingerprint = %kp.fingerprint(), "generated signing key");
            return Ok(kp);
        }

        // Read path. Refuse symlinks so the key cannot be redirected.
        let meta = std::fs::symlink_metadata(&key_path)
            .map_err(|e| CryptoError::KeyStore(e.to_string()))?;
        if meta.file_type().is_symlink() {
            return Err(CryptoError::KeyStore(
                "refusing to read key file: path is a symlink".into(),
            ));
        }

        let encoded = Zeroizing::new(
            std::fs::read_to_string(&key_path).map_err(|e| CryptoError::KeyStore(e.to_string()))?,
        );
        let seed = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| CryptoError::InvalidBase64Encoding)?,
        );
        let kp = Self::from_seed(&seed)?;

        // Re-materialize the public key if it went missing.
        if !dir.join(PUBLIC_KEY_FILE).exists() {
            kp.write_public_key(dir)?;
        }
        Ok(kp)
    }

    fn write_public_key(&self, dir: &Path) -> CryptoResult<()> {
        std::fs::write(dir.join(PUBLIC_KEY_FILE), self.public_key_base64())
            .map_err(|e| CryptoError::KeyStore(e.to_string()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature against a raw public key.
///
/// # Errors
///
/// Returns [`CryptoError::SignatureVerificationFailed`] on mismatch or
/// [`CryptoError::InvalidSignatureLength`] for a malformed signature.
pub fn verify_with(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    use ed25519_dalek::Verifier;

    let sig_bytes: [u8; 64] =
        signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignatureLength {
                expected: 64,
                actual: signature.len(),
            })?;
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| CryptoError::SignatureVerificationFailed)?;
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.verify(b"hello", &sig).is_ok());
        assert!(kp.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn seed_round_trip() {
        let kp = KeyPair::generate();
        let seed = kp.signing_key.to_bytes();
        let restored = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(kp.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn load_or_generate_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let kp1 = KeyPair::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join(PRIVATE_KEY_FILE).exists());
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());

        let kp2 = KeyPair::load_or_generate(dir.path()).unwrap();
        assert_eq!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn key_file_is_base64_text() {
        let dir = tempfile::tempdir().unwrap();
        let kp = KeyPair::load_or_generate(dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        let seed = BASE64.decode(text.trim()).unwrap();
        let restored = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(kp.public_key_bytes(), restored.public_key_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        KeyPair::load_or_generate(dir.path()).unwrap();
        let perms = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn refuses_symlinked_key_file() {
        let real = tempfile::tempdir().unwrap();
        let linked = tempfile::tempdir().unwrap();
        KeyPair::load_or_generate(real.path()).unwrap();
        std::os::unix::fs::symlink(
            real.path().join(PRIVATE_KEY_FILE),
            linked.path().join(PRIVATE_KEY_FILE),
        )
        .unwrap();

        let err = KeyPair::load_or_generate(linked.path()).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let kp = KeyPair::generate();
        let fp = kp.fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "not base64 at all!").unwrap();
        assert!(KeyPair::load_or_generate(dir.path()).is_err());
    }
}
