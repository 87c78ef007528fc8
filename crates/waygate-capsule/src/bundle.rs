//! Bundling user code.
//!
//! Dependency bundling is delegated to an external `esbuild` invocation and
//! treated as an opaque, deterministic step. Results are memoized in a
//! bounded LRU keyed by `(code, externals)`, so a repeated request never
//! re-invokes the bundler.

use std::num::NonZeroUsize;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{CapsuleError, CapsuleResult};

/// Default memo capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BundleKey {
    code: String,
    externals: Vec<String>,
}

/// Memoizing bundler.
#[derive(Debug)]
pub struct Bundler {
    cache: Mutex<LruCache<BundleKey, String>>,
    invocations: AtomicU64,
}

impl Default for Bundler {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl Bundler {
    /// Create a bundler with a bounded memo.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            invocations: AtomicU64::new(0),
        }
    }

    /// How many times the external bundler was actually invoked. Cache
    /// hits and identity bundles do not count.
    #[must_use]
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Bundle `code` with the given npm externals.
    ///
    /// With no externals the step is the identity: the sandbox runtime
    /// evaluates plain scripts directly and nothing needs resolution.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::DepsResolutionFailed`] when esbuild is
    /// missing or exits non-zero.
    pub async fn bundle(&self, code: &str, externals: &[String]) -> CapsuleResult<String> {
        if externals.is_empty() {
            return Ok(code.to_string());
        }

        let key = BundleKey {
            code: code.to_string(),
            externals: externals.to_vec(),
        };
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let output = self.run_esbuild(code, externals).await?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, output.clone());
        }
        Ok(output)
    }

    async fn run_esbuild(&self, code: &str, externals: &[String]) -> CapsuleResult<String> {
        let esbuild = which::which("esbuild").map_err(|_| {
            CapsuleError::DepsResolutionFailed(
                "esbuild not found on PATH but npm externals were declared".into(),
            )
        })?;

        self.invocations.fetch_add(1, Ordering::Relaxed);

        let mut cmd = Command::new(esbuild);
        cmd.arg("--bundle")
            .arg("--format=iife")
            .arg("--platform=neutral")
            .arg("--target=es2020")
            .arg("--loader=js");
        for pkg in externals {
            cmd.arg(format!("--external:{pkg}"));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CapsuleError::DepsResolutionFailed(format!("spawn esbuild: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(code.as_bytes())
                .await
                .map_err(|e| CapsuleError::DepsResolutionFailed(format!("feed esbuild: {e}")))?;
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| CapsuleError::DepsResolutionFailed(format!("wait esbuild: {e}")))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(CapsuleError::DepsResolutionFailed(format!(
                "esbuild failed: {}",
                stderr.trim()
            )));
        }

        String::from_utf8(out.stdout)
            .map_err(|_| CapsuleError::DepsResolutionFailed("esbuild emitted non-utf8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_without_externals() {
        let bundler = Bundler::default();
        let out = bundler.bundle("40+2", &[]).await.unwrap();
        assert_eq!(out, "40+2");
        assert_eq!(bundler.invocation_count(), 0);
    }

    #[tokio::test]
    async fn missing_esbuild_is_a_build_error() {
        // The test environment does not ship esbuild; if one is installed
        // the invocation path is exercised instead, which is also fine.
        let bundler = Bundler::default();
        let externals = vec!["left-pad".to_string()];
        let result = bundler.bundle("import 'left-pad';", &externals).await;
        if which::which("esbuild").is_err() {
            assert!(matches!(
                result,
                Err(CapsuleError::DepsResolutionFailed(_))
            ));
        }
    }

    #[test]
    fn cache_capacity_is_bounded() {
        let bundler = Bundler::with_capacity(2);
        let mut cache = bundler.cache.lock().unwrap();
        for i in 0..5 {
            cache.put(
                BundleKey {
                    code: format!("code{i}"),
                    externals: vec![],
                },
                format!("out{i}"),
            );
        }
        assert_eq!(cache.len(), 2);
    }
}
