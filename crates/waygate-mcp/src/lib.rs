//! Upstream MCP connections.
//!
//! The gateway proxies tool calls from sandboxed code (and from outside
//! callers) to configured MCP servers. Stdio upstreams are child processes
//! speaking newline-delimited JSON-RPC; HTTP upstreams are stateless POST
//! targets. Calls are never retried here: a failed upstream call surfaces
//! its message to the caller.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Upstream MCP error types.
pub mod error;
mod stdio;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::info;
use waygate_config::{McpServerConfig, McpTransport};

pub use error::{McpError, McpResult};

use crate::stdio::StdioConnection;

/// Default per-request deadline for stdio upstreams.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct Upstream {
    config: McpServerConfig,
    connection: Mutex<Option<Arc<StdioConnection>>>,
}

/// Holds one logical connection per configured upstream.
pub struct UpstreamManager {
    upstreams: HashMap<String, Upstream>,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl UpstreamManager {
    /// Create a manager over the configured upstreams. Nothing is spawned
    /// until the first call.
    #[must_use]
    pub fn new(configs: Vec<McpServerConfig>) -> Self {
        let upstreams = configs
            .into_iter()
            .map(|config| {
                (
                    config.name.clone(),
                    Upstream {
                        config,
                        connection: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self {
            upstreams,
            client: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request deadline (tests use short ones).
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Configured upstream names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.upstreams.keys().cloned().collect();
        names.sort();
        names
    }

    /// Call a tool on an upstream and return the MCP `result` payload.
    ///
    /// # Errors
    ///
    /// Unknown names, transport failures, per-request timeouts, and
    /// upstream-reported errors.
    pub async fn call_tool(&self, mcp: &str, tool: &str, params: Value) -> McpResult<Value> {
        self.rpc(mcp, "tools/call", json!({ "name": tool, "arguments": params }))
            .await
    }

    /// List an upstream's tools.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`UpstreamManager::call_tool`].
    pub async fn list_tools(&self, mcp: &str) -> McpResult<Value> {
        self.rpc(mcp, "tools/list", json!({})).await
    }

    /// Raw JSON-RPC against an upstream; the proxy endpoints use this.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`UpstreamManager::call_tool`].
    pub async fn rpc(&self, mcp: &str, method: &str, params: Value) -> McpResult<Value> {
        let upstream = self
            .upstreams
            .get(mcp)
            .ok_or_else(|| McpError::UnknownUpstream(mcp.to_string()))?;

        match upstream.config.transport {
            McpTransport::Stdio => {
                let connection = self.stdio_connection(upstream).await?;
                connection.request(method, params).await
            },
            McpTransport::Http => self.http_request(&upstream.config, method, params).await,
        }
    }

    /// Get or (re)spawn the stdio connection for an upstream.
    async fn stdio_connection(&self, upstream: &Upstream) -> McpResult<Arc<StdioConnection>> {
        let mut slot = upstream.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.is_alive() {
                return Ok(Arc::clone(connection));
            }
        }

        info!(upstream = %upstream.config.name, "spawning stdio upstream");
        let connection =
            Arc::new(StdioConnection::spawn(&upstream.config, self.request_timeout).await?);
        connection.initialize().await;
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn http_request(
        &self,
        config: &McpServerConfig,
        method: &str,
        params: Value,
    ) -> McpResult<Value> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| McpError::Unavailable {
                name: config.name.clone(),
                reason: "http upstream has no endpoint".into(),
            })?;

        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| McpError::Http(e.to_string()))?;

        let frame: Value = response
            .json()
            .await
            .map_err(|e| McpError::Http(e.to_string()))?;

        if let Some(error) = frame.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified upstream error")
                .to_string();
            return Err(McpError::Upstream { message });
        }
        Ok(frame.get("result").cloned().unwrap_or(Value::Null))
    }

    /// SIGTERM every running child, force-killing after the grace window.
    pub async fn shutdown(&self) {
        for upstream in self.upstreams.values() {
            let connection = upstream.connection.lock().await.take();
            if let Some(connection) = connection {
                connection.shutdown().await;
            }
        }
    }
}

impl std::fmt::Debug for UpstreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamManager")
            .field("upstreams", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A shell one-liner that answers every JSON-RPC request with a fixed
    /// result, echoing the request id back.
    const ECHO_SERVER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
  fi
done"#;

    fn echo_config(name: &str) -> McpServerConfig {
        let mut config = McpServerConfig::stdio(name, "sh");
        config.args = vec!["-c".to_string(), ECHO_SERVER.to_string()];
        config
    }

    #[tokio::test]
    async fn stdio_round_trip() {
        let manager = UpstreamManager::new(vec![echo_config("echo")]);
        let result = manager
            .call_tool("echo", "anything", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": true}));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_upstream_is_an_error() {
        let manager = UpstreamManager::new(vec![]);
        assert!(matches!(
            manager.call_tool("ghost", "t", json!({})).await,
            Err(McpError::UnknownUpstream(_))
        ));
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let mut config = McpServerConfig::stdio("mute", "sh");
        // Reads forever, never answers.
        config.args = vec![
            "-c".to_string(),
            "while IFS= read -r line; do :; done".to_string(),
        ];
        let manager = UpstreamManager::new(vec![config])
            .with_request_timeout(Duration::from_millis(300));

        let err = manager.call_tool("mute", "t", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }), "got: {err}");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn exiting_child_rejects_pending_and_respawns() {
        // Exits as soon as it has answered nothing; the handshake fails
        // softly and the call errors.
        let mut config = McpServerConfig::stdio("flaky", "true");
        config.args = vec![];
        let manager = UpstreamManager::new(vec![config])
            .with_request_timeout(Duration::from_millis(300));

        let err = manager.call_tool("flaky", "t", json!({})).await;
        assert!(err.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn upstream_reported_errors_surface_the_message() {
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"tool exploded"}}\n' "$id"
  fi
done"#;
        let mut config = McpServerConfig::stdio("angry", "sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        let manager = UpstreamManager::new(vec![config]);

        let err = manager.call_tool("angry", "t", json!({})).await.unwrap_err();
        match err {
            McpError::Upstream { message } => assert_eq!(message, "tool exploded"),
            other => panic!("unexpected error: {other}"),
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn http_upstream_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // A one-shot HTTP responder with a canned JSON-RPC result.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let manager = UpstreamManager::new(vec![McpServerConfig::http(
            "remote",
            format!("http://{addr}/rpc"),
        )]);
        let result = manager.list_tools("remote").await.unwrap();
        assert_eq!(result, json!({"tools": []}));
    }
}
