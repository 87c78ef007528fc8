//! Host-side seams for the injected guest surface.

use std::sync::Arc;

use async_trait::async_trait;

/// Receives stdout/stderr chunks as the guest produces them.
pub type OutputSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// The pair of sinks a caller supplies per run.
#[derive(Clone)]
pub struct RunSinks {
    /// Receives stdout chunks.
    pub stdout: OutputSink,
    /// Receives stderr chunks.
    pub stderr: OutputSink,
}

impl RunSinks {
    /// Sinks that drop everything; useful in tests.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            stdout: Arc::new(|_| {}),
            stderr: Arc::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for RunSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSinks").finish_non_exhaustive()
    }
}

/// Routes guest `__mcp_call` invocations to the upstream manager.
///
/// The runtime only knows this seam, not the transport behind it, which
/// keeps the runtime/dispatcher/upstream cycle broken at the type level.
#[async_trait]
pub trait McpBridge: Send + Sync {
    /// Names of the configured upstreams; one proxy object is injected per
    /// name.
    fn names(&self) -> Vec<String>;

    /// Call a tool on an upstream, returning the decoded MCP payload.
    ///
    /// # Errors
    ///
    /// Returns the upstream-reported failure message.
    async fn call(
        &self,
        mcp: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}
