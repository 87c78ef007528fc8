//! The capsule builder.
//!
//! Turns a run request into a signed, cached capsule and returns its
//! content hash. Identical requests hit the bundle memo and the capsule
//! cache: no re-bundling, no re-signing, no layer rewrites.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use waygate_core::{CapsuleHash, Language};
use waygate_crypto::{Jws, KeyPair};
use waygate_policy::{Policy, PolicyOverride, intersect};

use crate::bundle::Bundler;
use crate::error::{CapsuleError, CapsuleResult};
use crate::layer;
use crate::manifest::{
    CODE_LAYER_ID, CapsuleManifest, EntrySpec, LayerDescriptor, MANIFEST_VERSION, RuntimeSpec,
};
use crate::mounts;

/// File name of the manifest inside a capsule directory.
pub const MANIFEST_FILE: &str = "capsule.json";

/// A `run_js` request as received by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    /// The user's source code. Required.
    pub code: String,
    /// Optional stdin payload, shipped as `_stdin.txt` in the code layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Ordered argv for the guest.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment mapping for the guest.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory inside the VFS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Client policy override, intersected with the server default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyOverride>,
    /// npm externals; overrides the configured default set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npm: Option<Vec<String>>,
}

/// Result of a build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Content hash identifying the cached capsule.
    pub hash: CapsuleHash,
    /// The signed manifest.
    pub manifest: CapsuleManifest,
    /// Whether an existing cache entry satisfied the build.
    pub cache_hit: bool,
}

/// Builds and caches capsules.
pub struct CapsuleBuilder {
    cache_dir: PathBuf,
    server_policy: Policy,
    default_externals: Vec<String>,
    bundler: Bundler,
    keypair: Arc<KeyPair>,
    sign_count: AtomicU64,
}

impl CapsuleBuilder {
    /// Create a builder writing capsules under `cache_dir`.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        server_policy: Policy,
        default_externals: Vec<String>,
        keypair: Arc<KeyPair>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            server_policy,
            default_externals,
            bundler: Bundler::default(),
            keypair,
            sign_count: AtomicU64::new(0),
        }
    }

    /// The capsule cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// How many manifests have been signed. Cache hits do not sign.
    #[must_use]
    pub fn sign_count(&self) -> u64 {
        self.sign_count.load(Ordering::Relaxed)
    }

    /// How many times the external bundler ran.
    #[must_use]
    pub fn bundle_invocations(&self) -> u64 {
        self.bundler.invocation_count()
    }

    /// Build (or fetch from cache) the capsule for a request.
    ///
    /// # Errors
    ///
    /// [`CapsuleError::Validation`] for an empty `code`,
    /// [`CapsuleError::DepsResolutionFailed`] for bundler or mount
    /// failures, and I/O or signer errors for infrastructure faults.
    pub async fn build(&self, req: &RunRequest) -> CapsuleResult<BuildOutput> {
        if req.code.trim().is_empty() {
            return Err(CapsuleError::Validation("`code` must not be empty".into()));
        }

        let externals = req
            .npm
            .clone()
            .unwrap_or_else(|| self.default_externals.clone());
        let bundled = self.bundler.bundle(&req.code, &externals).await?;
        let entry_code = render_entry(&bundled)?;

        let mut code_entries = vec![("entry.js".to_string(), entry_code.into_bytes())];
        if let Some(stdin) = &req.stdin {
            code_entries.push(("_stdin.txt".to_string(), stdin.clone().into_bytes()));
        }
        let code_zip = layer::write_zip(code_entries)?;

        let policy = intersect(&self.server_policy, req.policy.as_ref());

        let mut fs_layers = vec![LayerDescriptor {
            id: CODE_LAYER_ID.to_string(),
            sha256: layer::sha256_hex(&code_zip),
            path: "fs.code.zip".to_string(),
            target: None,
        }];
        let mut layer_blobs = vec![("fs.code.zip".to_string(), code_zip)];

        if let Some(specs) = &policy.filesystem.mounts {
            for (index, spec) in specs.iter().enumerate() {
                let bytes = mounts::build_mount_layer(spec).await?;
                let id = format!("mount{index}");
                let path = format!("fs.{id}.zip");
                fs_layers.push(LayerDescriptor {
                    id,
                    sha256: layer::sha256_hex(&bytes),
                    path: path.clone(),
                    target: Some(spec.target.clone()),
                });
                layer_blobs.push((path, bytes));
            }
        }

        let mut manifest = CapsuleManifest {
            version: MANIFEST_VERSION.to_string(),
            language: Language::Js,
            runtime: RuntimeSpec {
                id: crate::RUNTIME_ID.to_string(),
            },
            entry: EntrySpec {
                path: "entry.js".to_string(),
                argv: req.args.clone(),
                env: req.env.clone(),
                cwd: req.cwd.clone().unwrap_or_else(|| "/".to_string()),
            },
            fs_layers,
            policy,
            sig: None,
        };

        let hash = manifest.content_hash()?;
        let capsule_dir = self.cache_dir.join(hash.as_str());
        let manifest_path = capsule_dir.join(MANIFEST_FILE);

        // A partial write has no capsule.json, so its presence is the
        // cache-hit criterion.
        if manifest_path.exists() {
            debug!(capsule = %hash, "capsule cache hit");
            let text = std::fs::read_to_string(&manifest_path)?;
            let cached: CapsuleManifest = serde_json::from_str(&text)?;
            return Ok(BuildOutput {
                hash,
                manifest: cached,
                cache_hit: true,
            });
        }

        let canonical = manifest.canonical_unsigned_json()?;
        manifest.sig = Some(Jws::sign(&self.keypair, canonical.as_bytes()));
        self.sign_count.fetch_add(1, Ordering::Relaxed);

        std::fs::create_dir_all(&capsule_dir)?;
        for (name, bytes) in layer_blobs {
            std::fs::write(capsule_dir.join(name), bytes)?;
        }
        // The manifest goes last so readers never see a half-written entry.
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        info!(capsule = %hash, "capsule built");
        Ok(BuildOutput {
            hash,
            manifest,
            cache_hit: false,
        })
    }
}

impl std::fmt::Debug for CapsuleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleBuilder")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

/// Console guard prepended to every entry script. The server runtime
/// installs a real console before evaluation; bare executors get no-ops.
const CONSOLE_SHIM: &str = r#"if (typeof globalThis.console === "undefined") {
  globalThis.console = { log() {}, info() {}, warn() {}, error() {} };
}
"#;

/// Evaluator appended after the embedded code literal. Expression-shaped
/// programs keep their completion value; statement bodies may `return` and
/// `await`. The resulting promise lands on `globalThis.__capsule_result`
/// for the host to await.
const EVAL_TRAILER: &str = r#"const __AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
let __fn;
try {
  __fn = new __AsyncFunction('"use strict"; return (\n' + __code + '\n);');
} catch (err) {
  __fn = new __AsyncFunction('"use strict";\n' + __code);
}
globalThis.__capsule_result = __fn();
"#;

fn render_entry(bundled: &str) -> CapsuleResult<String> {
    let literal = serde_json::to_string(bundled)?;
    Ok(format!("{CONSOLE_SHIM}const __code = {literal};\n{EVAL_TRAILER}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::read_zip_entry;

    fn builder(dir: &Path) -> CapsuleBuilder {
        CapsuleBuilder::new(
            dir,
            Policy::server_default(),
            Vec::new(),
            Arc::new(KeyPair::generate()),
        )
    }

    fn request(code: &str) -> RunRequest {
        RunRequest {
            code: code.to_string(),
            ..RunRequest::default()
        }
    }

    #[tokio::test]
    async fn identical_requests_share_a_hash_and_signature() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());

        let first = builder.build(&request("console.log('hi')")).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(builder.sign_count(), 1);

        let second = builder.build(&request("console.log('hi')")).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.hash, second.hash);
        // The cache hit signed nothing and invoked no bundler.
        assert_eq!(builder.sign_count(), 1);
        assert_eq!(builder.bundle_invocations(), 0);
        assert_eq!(first.manifest.sig, second.manifest.sig);
    }

    #[tokio::test]
    async fn different_inputs_change_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());

        let base = builder.build(&request("1")).await.unwrap();
        let other_code = builder.build(&request("2")).await.unwrap();
        assert_ne!(base.hash, other_code.hash);

        let with_stdin = builder
            .build(&RunRequest {
                stdin: Some("input".to_string()),
                ..request("1")
            })
            .await
            .unwrap();
        assert_ne!(base.hash, with_stdin.hash);

        let with_env = builder
            .build(&RunRequest {
                env: [("K".to_string(), "V".to_string())].into(),
                ..request("1")
            })
            .await
            .unwrap();
        assert_ne!(base.hash, with_env.hash);
    }

    #[tokio::test]
    async fn capsule_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());

        let out = builder
            .build(&RunRequest {
                stdin: Some("in".to_string()),
                ..request("40+2")
            })
            .await
            .unwrap();

        let capsule_dir = dir.path().join(out.hash.as_str());
        assert!(capsule_dir.join("capsule.json").exists());
        let zip = std::fs::read(capsule_dir.join("fs.code.zip")).unwrap();
        assert_eq!(
            layer::sha256_hex(&zip),
            out.manifest.code_layer().unwrap().sha256
        );

        let entry = read_zip_entry(&zip, "entry.js").unwrap();
        let entry = String::from_utf8(entry).unwrap();
        assert!(entry.contains("__capsule_result"));
        assert!(entry.contains("\"40+2\""));
        assert_eq!(read_zip_entry(&zip, "_stdin.txt").unwrap(), b"in");
    }

    #[tokio::test]
    async fn signature_verifies_against_the_canonical_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = Arc::new(KeyPair::generate());
        let builder = CapsuleBuilder::new(
            dir.path(),
            Policy::server_default(),
            Vec::new(),
            Arc::clone(&keypair),
        );

        let out = builder.build(&request("1+1")).await.unwrap();
        let sig = out.manifest.sig.clone().unwrap();
        let payload = Jws::verify(keypair.public_key_bytes(), &sig).unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            out.manifest.canonical_unsigned_json().unwrap()
        );
    }

    #[tokio::test]
    async fn empty_code_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());
        assert!(matches!(
            builder.build(&request("  ")).await,
            Err(CapsuleError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn client_policy_narrows_the_manifest_policy() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder(dir.path());

        let out = builder
            .build(&RunRequest {
                policy: Some(serde_json::from_str(r#"{"limits":{"timeoutMs":200}}"#).unwrap()),
                ..request("while(true){}")
            })
            .await
            .unwrap();
        assert_eq!(out.manifest.policy.limits.timeout_ms, 200);
        assert_eq!(out.manifest.policy.limits.mem_mb, 256);
    }

    #[tokio::test]
    async fn directory_mounts_become_layers() {
        let dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("data.txt"), "d").unwrap();

        let mut policy = Policy::server_default();
        policy.filesystem.mounts = Some(vec![waygate_policy::MountSpec {
            source: source.path().to_string_lossy().into_owned(),
            target: "/data".to_string(),
            mount_type: waygate_policy::MountType::Directory,
            readonly: true,
            git_ref: None,
        }]);
        let builder =
            CapsuleBuilder::new(dir.path(), policy, Vec::new(), Arc::new(KeyPair::generate()));

        let out = builder.build(&request("1")).await.unwrap();
        let mounts = out.manifest.mount_layers();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].id, "mount0");
        assert_eq!(mounts[0].target.as_deref(), Some("/data"));
        assert!(
            dir.path()
                .join(out.hash.as_str())
                .join("fs.mount0.zip")
                .exists()
        );
    }
}
