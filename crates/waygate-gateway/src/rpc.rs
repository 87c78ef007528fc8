//! The JSON-RPC `/mcp` surface.
//!
//! `tools/call` is the heart of the gateway: build a capsule, route it to
//! an attached browser executor when one exists (falling back to the local
//! runtime), and fold the run's event stream into MCP content blocks. Run
//! failures are results with `isError`, never transport errors.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, warn};
use waygate_capsule::{BuildOutput, CapsuleError, RunRequest};
use waygate_core::{ExecutionEvent, RunId};
use waygate_runtime::RunSinks;

use crate::context::GatewayContext;
use crate::session::SessionCommand;

/// Backchannel poll cadence while a remote run is in flight.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dispatch one JSON-RPC request value to a response value.
pub(crate) async fn handle(ctx: &GatewayContext, request: Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();

    match method {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "waygate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "notifications/initialized" => Value::Null,
        "tools/list" => rpc_result(id, tools_list()),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            tools_call(ctx, id, params).await
        },
        other => rpc_error(id, -32601, &format!("method not found: {other}")),
    }
}

fn tools_list() -> Value {
    json!({
        "tools": [{
            "name": "run_js",
            "description": "Execute JavaScript in the sandboxed runtime",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "JavaScript source to execute" },
                    "stdin": { "type": "string" },
                    "args": { "type": "array", "items": { "type": "string" } },
                    "env": { "type": "object", "additionalProperties": { "type": "string" } },
                    "cwd": { "type": "string" },
                    "policy": { "type": "object" },
                },
                "required": ["code"],
            },
        }],
    })
}

async fn tools_call(ctx: &GatewayContext, id: Value, params: Value) -> Value {
    let tool = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if tool != "run_js" {
        return rpc_error(id, -32602, &format!("unknown tool: {tool}"));
    }

    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    let request: RunRequest = match serde_json::from_value(arguments) {
        Ok(request) => request,
        Err(e) => return rpc_error(id, -32602, &format!("invalid arguments: {e}")),
    };

    emit_progress(progress("building"));
    let built = match ctx.builder.build(&request).await {
        Ok(built) => built,
        Err(CapsuleError::Validation(message)) => {
            return rpc_error(id, -32602, &message);
        },
        Err(CapsuleError::DepsResolutionFailed(message)) => {
            return rpc_error(id, -32000, &format!("dependency resolution failed: {message}"));
        },
        Err(e) => {
            warn!(error = %e, "capsule build failed");
            return rpc_error(id, -32603, "internal error building capsule");
        },
    };

    let run = match ctx.dispatcher.pick_attached() {
        Some(session) => run_remote(ctx, session, &built).await,
        None => run_local(ctx, &built).await,
    };

    match run {
        Ok(run) => rpc_result(id, run.into_content()),
        Err(message) => rpc_error(id, -32603, &message),
    }
}

/// Folded outcome of one run, local or remote.
struct RunResult {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    last_value: Option<String>,
}

impl RunResult {
    /// MCP content blocks: stdout (or the last value when there is no
    /// stdout), with stderr appended on failure.
    fn into_content(self) -> Value {
        let is_error = self.exit_code != 0;
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if text.is_empty() {
            if let Some(value) = &self.last_value {
                text.clone_from(value);
            }
        }
        if is_error {
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        })
    }
}

async fn run_local(ctx: &GatewayContext, built: &BuildOutput) -> Result<RunResult, String> {
    let stdout = Arc::new(Mutex::new(Vec::new()));
    let stderr = Arc::new(Mutex::new(Vec::new()));
    let sink_out = Arc::clone(&stdout);
    let sink_err = Arc::clone(&stderr);
    let sinks = RunSinks {
        stdout: Arc::new(move |bytes| {
            if let Ok(mut buffer) = sink_out.lock() {
                buffer.extend_from_slice(bytes);
            }
        }),
        stderr: Arc::new(move |bytes| {
            if let Ok(mut buffer) = sink_err.lock() {
                buffer.extend_from_slice(bytes);
            }
        }),
    };

    let outcome = ctx
        .runtime
        .execute(&built.hash, sinks)
        .await
        .map_err(|e| format!("runtime failure: {e}"))?;

    let stdout = stdout.lock().map(|b| b.clone()).unwrap_or_default();
    let stderr = stderr.lock().map(|b| b.clone()).unwrap_or_default();
    Ok(RunResult {
        exit_code: outcome.exit_code,
        stdout,
        stderr,
        last_value: outcome.last_value,
    })
}

async fn run_remote(
    ctx: &GatewayContext,
    session: waygate_core::SessionId,
    built: &BuildOutput,
) -> Result<RunResult, String> {
    let run_id = RunId::new();
    let base = format!("/capsules/{}", built.hash);
    let layer_urls = built
        .manifest
        .mount_layers()
        .iter()
        .map(|layer| format!("{base}/{}", layer.path))
        .collect();

    let command = SessionCommand::Capsule {
        manifest_url: format!("{base}/capsule.json"),
        code_url: format!("{base}/fs.code.zip"),
        layer_urls,
        run_id,
    };

    if ctx.dispatcher.send_command(&session, command).is_err() {
        // The executor detached in the meantime; the local runtime covers.
        debug!(run = %run_id, "executor lost before dispatch, running locally");
        return run_local(ctx, built).await;
    }
    // Joins the run's FIFO so pollers see the lifecycle alongside the
    // executor's own events.
    let _ = ctx
        .dispatcher
        .add_result(&session, run_id, progress("dispatched"));

    let deadline = Duration::from_millis(built.manifest.policy.limits.timeout_ms);
    let started = Instant::now();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    loop {
        for event in ctx.dispatcher.take_results(&run_id) {
            match event {
                ExecutionEvent::Progress { phase } => {
                    debug!(run = %run_id, phase = %phase, "remote progress");
                },
                ExecutionEvent::Stdout { bytes } => stdout.extend_from_slice(&bytes),
                ExecutionEvent::Stderr { bytes } => stderr.extend_from_slice(&bytes),
                ExecutionEvent::Exit { code, .. } => {
                    ctx.dispatcher.clear_results(&run_id);
                    return Ok(RunResult {
                        exit_code: code,
                        stdout,
                        stderr,
                        last_value: None,
                    });
                },
                ExecutionEvent::Error { kind, message } => {
                    ctx.dispatcher.clear_results(&run_id);
                    stderr.extend_from_slice(message.as_bytes());
                    stderr.push(b'\n');
                    let exit_code = if kind == waygate_core::ErrorKind::Timeout {
                        124
                    } else {
                        1
                    };
                    return Ok(RunResult {
                        exit_code,
                        stdout,
                        stderr,
                        last_value: None,
                    });
                },
            }
        }

        if started.elapsed() >= deadline {
            // Synthesize the timeout and tell the executor to stop.
            ctx.dispatcher.cancel_run(&run_id);
            ctx.dispatcher.clear_results(&run_id);
            stderr.extend_from_slice(b"timeout: no terminal event before the deadline\n");
            return Ok(RunResult {
                exit_code: 124,
                stdout,
                stderr,
                last_value: None,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Lifecycle marker for a run (`building`, `dispatched`, `running`).
fn progress(phase: &str) -> ExecutionEvent {
    ExecutionEvent::Progress {
        phase: phase.to_string(),
    }
}

/// Gateway-synthesized progress events have no queue of their own before a
/// run exists; they surface on the log stream.
fn emit_progress(event: ExecutionEvent) {
    if let ExecutionEvent::Progress { phase } = &event {
        debug!(phase = %phase, "run lifecycle");
    }
}

/// A JSON-RPC success envelope.
pub(crate) fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// A JSON-RPC error envelope.
pub(crate) fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
