//! The stdio transport.
//!
//! One child process per upstream, spawned lazily on first call. Frames
//! are newline-delimited JSON-RPC: a single writer owns the child's stdin,
//! a reader task resolves the pending-request map by id, and every pending
//! entry carries its own deadline. When the child exits, all in-flight
//! requests reject and the connection reports not-ready until the next
//! call respawns it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};
use waygate_config::McpServerConfig;

use crate::error::{McpError, McpResult};

/// Grace window between SIGTERM and a forced kill at shutdown.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<McpResult<Value>>>>>;

pub(crate) struct StdioConnection {
    name: String,
    child: Mutex<Child>,
    writer: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl StdioConnection {
    /// Spawn the child and start the reader task.
    pub(crate) async fn spawn(
        config: &McpServerConfig,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| McpError::Unavailable {
                name: config.name.clone(),
                reason: "stdio upstream has no command".into(),
            })?;

        let mut child = Command::new(command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Unavailable {
                name: config.name.clone(),
                reason: format!("spawn {command}: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Unavailable {
            name: config.name.clone(),
            reason: "child has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Unavailable {
            name: config.name.clone(),
            reason: "child has no stdout".into(),
        })?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Child stderr goes to the log, never to callers.
        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(upstream = %name, "stderr: {line}");
                }
            });
        }

        // Reader task: correlate responses by id; ids may complete in any
        // order relative to the requests that created them.
        {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                                warn!(upstream = %name, "discarding non-JSON frame");
                                continue;
                            };
                            let Some(id) = frame.get("id").and_then(Value::as_u64) else {
                                debug!(upstream = %name, "ignoring notification");
                                continue;
                            };
                            let Some(tx) = pending.lock().await.remove(&id) else {
                                continue;
                            };
                            let outcome = if let Some(error) = frame.get("error") {
                                let message = error
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unspecified upstream error")
                                    .to_string();
                                Err(McpError::Upstream { message })
                            } else {
                                Ok(frame.get("result").cloned().unwrap_or(Value::Null))
                            };
                            let _ = tx.send(outcome);
                        },
                        Ok(None) | Err(_) => break,
                    }
                }

                // EOF: reject everything in flight and mark not-ready.
                alive.store(false, Ordering::Relaxed);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(McpError::ConnectionClosed(name.clone())));
                }
                debug!(upstream = %name, "stdio connection closed");
            });
        }

        Ok(Self {
            name: config.name.clone(),
            child: Mutex::new(child),
            writer: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            request_timeout,
        })
    }

    /// Whether the child is still believed to be running.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// The `initialize` handshake. A handshake failure is logged and
    /// tolerated; plenty of servers answer tool calls anyway.
    pub(crate) async fn initialize(&self) {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "waygate", "version": env!("CARGO_PKG_VERSION") },
        });
        match self.request("initialize", params).await {
            Ok(_) => {
                let _ = self
                    .notify("notifications/initialized", Value::Null)
                    .await;
            },
            Err(e) => {
                warn!(upstream = %self.name, error = %e, "initialize handshake failed, continuing");
            },
        }
    }

    /// Send a request and wait for its response or deadline.
    pub(crate) async fn request(&self, method: &str, params: Value) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed(self.name.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    name: self.name.clone(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            },
        }
    }

    async fn notify(&self, method: &str, params: Value) -> McpResult<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> McpResult<()> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Unavailable {
                name: self.name.clone(),
                reason: format!("write: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::Unavailable {
            name: self.name.clone(),
            reason: format!("flush: {e}"),
        })
    }

    /// SIGTERM, a grace window, then a hard kill.
    pub(crate) async fn shutdown(&self) {
        let mut child = self.child.lock().await;

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let pid = nix::unistd::Pid::from_raw(match i32::try_from(pid) {
                Ok(pid) => pid,
                Err(_) => return,
            });
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait())
            .await
            .is_err()
        {
            warn!(upstream = %self.name, "grace window elapsed, killing child");
            let _ = child.kill().await;
        }
    }
}

impl std::fmt::Debug for StdioConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioConnection")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}
