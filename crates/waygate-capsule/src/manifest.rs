//! The capsule manifest.
//!
//! The manifest is identified by the first 16 hex digits of SHA-256 over
//! its canonical JSON *without* the `sig` field: the signature never
//! participates in identity, so identical unsigned manifests always land on
//! the same cache entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use waygate_core::{CapsuleHash, Language};
use waygate_policy::Policy;

use crate::error::CapsuleResult;

/// Manifest format version.
pub const MANIFEST_VERSION: &str = "1";

/// Layer id reserved for the code layer.
pub const CODE_LAYER_ID: &str = "code";

/// Runtime identity block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Runtime identity string, e.g. `quickjs@2025-10`.
    pub id: String,
}

/// Entry point description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySpec {
    /// Path of the entry script inside the code layer.
    pub path: String,
    /// Ordered argv handed to the guest.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Environment mapping handed to the guest. Ordered so the canonical
    /// form is stable.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory inside the virtual filesystem.
    pub cwd: String,
}

/// One filesystem layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Layer id; exactly one layer per capsule has id `code`.
    pub id: String,
    /// SHA-256 (hex) over the layer's ZIP bytes.
    pub sha256: String,
    /// File name of the ZIP inside the capsule directory.
    pub path: String,
    /// Absolute VFS path where the layer materializes; absent for the code
    /// layer, which overlays the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// The capsule manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleManifest {
    /// Format version, always [`MANIFEST_VERSION`].
    pub version: String,
    /// Guest language.
    pub language: Language,
    /// Runtime identity.
    pub runtime: RuntimeSpec,
    /// Entry point.
    pub entry: EntrySpec,
    /// Ordered layers; the code layer first, then mounts.
    pub fs_layers: Vec<LayerDescriptor>,
    /// The intersected policy the run executes under.
    pub policy: Policy,
    /// Detached compact JWS over the unsigned manifest; absent until
    /// signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl CapsuleManifest {
    /// Canonical JSON of the manifest without `sig`.
    ///
    /// serde_json object keys sort lexicographically, so serializing
    /// through `Value` yields a canonical form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn canonical_unsigned_json(&self) -> CapsuleResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("sig");
        }
        Ok(value.to_string())
    }

    /// Content hash: first 16 hex digits of SHA-256 over the canonical
    /// unsigned JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn content_hash(&self) -> CapsuleResult<CapsuleHash> {
        let canonical = self.canonical_unsigned_json()?;
        let digest = Sha256::digest(canonical.as_bytes());
        let hash = hex::encode(&digest[..8]);
        CapsuleHash::parse(&hash)
            .map_err(|e| crate::error::CapsuleError::Validation(e.to_string()))
    }

    /// The code layer descriptor.
    #[must_use]
    pub fn code_layer(&self) -> Option<&LayerDescriptor> {
        self.fs_layers.iter().find(|l| l.id == CODE_LAYER_ID)
    }

    /// Mount layers, in declaration order.
    #[must_use]
    pub fn mount_layers(&self) -> Vec<&LayerDescriptor> {
        self.fs_layers
            .iter()
            .filter(|l| l.id != CODE_LAYER_ID)
            .collect()
    }
}
