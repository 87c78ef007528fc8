//! Read side of the capsule cache.
//!
//! Capsules are immutable once `capsule.json` exists, so the store never
//! locks: it only reads fully-written entries and treats a missing
//! manifest as a cache miss.

use std::path::{Path, PathBuf};

use waygate_core::CapsuleHash;

use crate::builder::MANIFEST_FILE;
use crate::error::{CapsuleError, CapsuleResult};
use crate::layer;
use crate::manifest::CapsuleManifest;

/// Reads cached capsules for the runtime and the HTTP surface.
#[derive(Debug, Clone)]
pub struct CapsuleStore {
    cache_dir: PathBuf,
}

impl CapsuleStore {
    /// Open a store over the builder's cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Whether `name` has the shape of a servable capsule file:
    /// `capsule.json` or `fs.<layerId>.zip`. Anything else is refused
    /// before touching the filesystem.
    #[must_use]
    pub fn is_valid_file_name(name: &str) -> bool {
        if name == MANIFEST_FILE {
            return true;
        }
        let Some(middle) = name
            .strip_prefix("fs.")
            .and_then(|rest| rest.strip_suffix(".zip"))
        else {
            return false;
        };
        !middle.is_empty()
            && middle
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// Load a capsule manifest.
    ///
    /// # Errors
    ///
    /// [`CapsuleError::NotFound`] when the capsule is not cached.
    pub fn load_manifest(&self, hash: &CapsuleHash) -> CapsuleResult<CapsuleManifest> {
        let path = self.cache_dir.join(hash.as_str()).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(CapsuleError::NotFound(hash.clone()));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read a capsule file's bytes, validating the name shape first.
    ///
    /// # Errors
    ///
    /// [`CapsuleError::Validation`] for a forbidden name,
    /// [`CapsuleError::NotFound`] when the capsule or file is absent.
    pub fn file_bytes(&self, hash: &CapsuleHash, name: &str) -> CapsuleResult<Vec<u8>> {
        if !Self::is_valid_file_name(name) {
            return Err(CapsuleError::Validation(format!(
                "not a capsule file name: {name}"
            )));
        }
        let path = self.cache_dir.join(hash.as_str()).join(name);
        if !path.exists() {
            return Err(CapsuleError::NotFound(hash.clone()));
        }
        Ok(std::fs::read(path)?)
    }

    /// Read and return the entry script source for a manifest.
    ///
    /// # Errors
    ///
    /// Missing capsule, malformed layer, or a non-UTF-8 entry script.
    pub fn entry_source(
        &self,
        hash: &CapsuleHash,
        manifest: &CapsuleManifest,
    ) -> CapsuleResult<String> {
        let code_layer = manifest
            .code_layer()
            .ok_or_else(|| CapsuleError::Layer("manifest has no code layer".into()))?;
        let zip = self.file_bytes(hash, &code_layer.path)?;
        let bytes = layer::read_zip_entry(&zip, &manifest.entry.path)?;
        String::from_utf8(bytes)
            .map_err(|_| CapsuleError::Layer("entry script is not utf-8".into()))
    }

    /// Materialize all layers under `root`: the code layer at the root,
    /// each mount layer under its target.
    ///
    /// # Errors
    ///
    /// Missing capsule, malformed layers, or extraction I/O failures.
    pub fn materialize(
        &self,
        hash: &CapsuleHash,
        manifest: &CapsuleManifest,
        root: &Path,
    ) -> CapsuleResult<()> {
        for descriptor in &manifest.fs_layers {
            let zip = self.file_bytes(hash, &descriptor.path)?;
            let dest = match &descriptor.target {
                Some(target) => root.join(target.trim_start_matches('/')),
                None => root.to_path_buf(),
            };
            layer::extract_zip(&zip, &dest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{CapsuleBuilder, RunRequest};
    use std::sync::Arc;
    use waygate_crypto::KeyPair;
    use waygate_policy::Policy;

    async fn build_one(dir: &Path, code: &str) -> (CapsuleHash, CapsuleManifest) {
        let builder = CapsuleBuilder::new(
            dir,
            Policy::server_default(),
            Vec::new(),
            Arc::new(KeyPair::generate()),
        );
        let out = builder
            .build(&RunRequest {
                code: code.to_string(),
                ..RunRequest::default()
            })
            .await
            .unwrap();
        (out.hash, out.manifest)
    }

    #[test]
    fn file_name_allowlist() {
        assert!(CapsuleStore::is_valid_file_name("capsule.json"));
        assert!(CapsuleStore::is_valid_file_name("fs.code.zip"));
        assert!(CapsuleStore::is_valid_file_name("fs.mount0.zip"));

        for forbidden in [
            "capsule.json.bak",
            "fs..zip",
            "fs.code.zip.exe",
            "../capsule.json",
            "fs.../../x.zip",
            "signing.key",
            "",
        ] {
            assert!(
                !CapsuleStore::is_valid_file_name(forbidden),
                "{forbidden} should be forbidden"
            );
        }
    }

    #[tokio::test]
    async fn manifest_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let (hash, manifest) = build_one(dir.path(), "40+2").await;

        let store = CapsuleStore::new(dir.path());
        let loaded = store.load_manifest(&hash).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.content_hash().unwrap(), hash);
    }

    #[tokio::test]
    async fn entry_source_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let (hash, manifest) = build_one(dir.path(), "console.log('x')").await;

        let store = CapsuleStore::new(dir.path());
        let source = store.entry_source(&hash, &manifest).unwrap();
        assert!(source.contains("__capsule_result"));
    }

    #[tokio::test]
    async fn missing_capsule_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CapsuleStore::new(dir.path());
        let hash = CapsuleHash::parse("0123456789abcdef").unwrap();
        assert!(matches!(
            store.load_manifest(&hash),
            Err(CapsuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn materialize_lays_out_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let (hash, manifest) = build_one(dir.path(), "1").await;

        let store = CapsuleStore::new(dir.path());
        let root = tempfile::tempdir().unwrap();
        store.materialize(&hash, &manifest, root.path()).unwrap();
        assert!(root.path().join("entry.js").exists());
    }
}
