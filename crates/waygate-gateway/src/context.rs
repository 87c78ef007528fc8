//! The shared gateway context.
//!
//! Builder, runtime, dispatcher, and upstream manager reference each other
//! at runtime (tools/call uses all four), so they live together in one
//! context value passed explicitly to the handlers instead of as
//! module-level singletons.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use waygate_capsule::{CapsuleBuilder, CapsuleStore};
use waygate_config::GatewayConfig;
use waygate_crypto::KeyPair;
use waygate_mcp::UpstreamManager;
use waygate_runtime::{JsRuntime, McpBridge};

use crate::error::{GatewayError, GatewayResult};
use crate::session::SessionDispatcher;

/// Everything a request handler needs.
pub struct GatewayContext {
    /// Loaded configuration.
    pub config: GatewayConfig,
    /// Capsule builder (and its caches).
    pub builder: Arc<CapsuleBuilder>,
    /// Read side of the capsule cache.
    pub store: CapsuleStore,
    /// The local sandbox runtime.
    pub runtime: Arc<JsRuntime>,
    /// The session dispatcher.
    pub dispatcher: Arc<SessionDispatcher>,
    /// Upstream MCP connections.
    pub upstreams: Arc<UpstreamManager>,
    /// Whether the root UI page is served.
    pub no_ui: bool,
}

impl GatewayContext {
    /// Wire up every component from a loaded configuration.
    ///
    /// Loads or generates the signing key (reporting its fingerprint) and
    /// starts the session reaper.
    ///
    /// # Errors
    ///
    /// Key store failures surface as [`GatewayError::Startup`].
    pub fn initialize(config: GatewayConfig, no_ui: bool) -> GatewayResult<Arc<Self>> {
        let keypair = Arc::new(
            KeyPair::load_or_generate(&config.signing_key_path)
                .map_err(|e| GatewayError::Startup(format!("signing key: {e}")))?,
        );
        info!(fingerprint = %keypair.fingerprint(), "signing key ready");

        let builder = Arc::new(CapsuleBuilder::new(
            &config.cache_dir,
            config.policy.clone(),
            config.npm.dependencies.clone(),
            Arc::clone(&keypair),
        ));
        let store = CapsuleStore::new(&config.cache_dir);
        let upstreams = Arc::new(UpstreamManager::new(config.mcps.clone()));

        let runtime = Arc::new(
            JsRuntime::new(store.clone()).with_mcp(Arc::new(UpstreamBridge(Arc::clone(
                &upstreams,
            )))),
        );

        let dispatcher = Arc::new(SessionDispatcher::new(
            Arc::clone(&keypair),
            Duration::from_millis(config.session_ttl_ms),
        ));

        // Session reaper: one sweep a minute.
        {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    dispatcher.reap_idle();
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            builder,
            store,
            runtime,
            dispatcher,
            upstreams,
            no_ui,
        }))
    }

    /// Graceful shutdown: close sessions, terminate upstream children.
    pub async fn shutdown(&self) {
        self.dispatcher.close_all();
        self.upstreams.shutdown().await;
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("no_ui", &self.no_ui)
            .finish_non_exhaustive()
    }
}

/// Adapts the upstream manager to the runtime's bridge seam.
struct UpstreamBridge(Arc<UpstreamManager>);

#[async_trait]
impl McpBridge for UpstreamBridge {
    fn names(&self) -> Vec<String> {
        self.0.names()
    }

    async fn call(
        &self,
        mcp: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        self.0
            .call_tool(mcp, method, params)
            .await
            .map_err(|e| e.to_string())
    }
}
