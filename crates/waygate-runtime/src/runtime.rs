//! The executor.
//!
//! One fresh engine per run: materialize the capsule's layers into a
//! temporary root, install the host bridges, evaluate the entry script,
//! drive pending jobs until the result promise settles or the deadline
//! fires, and map every failure mode onto an exit code.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rquickjs::function::{Async, Func};
use rquickjs::{AsyncContext, AsyncRuntime, CatchResultExt, async_with};
use serde_json::{Value, json};
use tracing::debug;
use waygate_capsule::CapsuleStore;
use waygate_core::{CapsuleHash, RunUsage};
use waygate_policy::{FsEnforcer, Limits, NetworkEnforcer};
use waygate_vfs::{ReadOptions, ReadOutput, SandboxFs, WriteMode};

use crate::bridge::{McpBridge, RunSinks};
use crate::error::{RuntimeError, RuntimeResult};
use crate::fetch::{FetchInit, guarded_fetch};

/// Exit code for a wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code for a memory-limit abort.
pub const EXIT_MEMORY: i32 = 137;

/// Result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Process-style exit code.
    pub exit_code: i32,
    /// Stringified value of the entry's last expression, when there is one.
    pub last_value: Option<String>,
    /// Resource usage.
    pub usage: RunUsage,
}

/// Executes capsules in an embedded QuickJS engine.
pub struct JsRuntime {
    store: CapsuleStore,
    mcp: Option<Arc<dyn McpBridge>>,
}

impl JsRuntime {
    /// Create a runtime reading capsules from `store`.
    #[must_use]
    pub fn new(store: CapsuleStore) -> Self {
        Self { store, mcp: None }
    }

    /// Attach the MCP bridge; one guest proxy object is injected per
    /// upstream name.
    #[must_use]
    pub fn with_mcp(mut self, bridge: Arc<dyn McpBridge>) -> Self {
        self.mcp = Some(bridge);
        self
    }

    /// Execute a capsule.
    ///
    /// Guest failures (throws, denials, limit hits) come back as non-zero
    /// exit codes with diagnostics on the stderr sink; only infrastructure
    /// faults error.
    ///
    /// # Errors
    ///
    /// Capsule loading, work-root preparation, or engine setup failures.
    pub async fn execute(&self, hash: &CapsuleHash, sinks: RunSinks) -> RuntimeResult<RunOutcome> {
        let manifest = self.store.load_manifest(hash)?;
        let entry_source = self.store.entry_source(hash, &manifest)?;

        // Fresh work root per run; dropped (deleted) on every exit path.
        let work_root = tempfile::tempdir()?;
        self.store.materialize(hash, &manifest, work_root.path())?;
        for writable in &manifest.policy.filesystem.writable {
            let rel = writable.trim_start_matches('/');
            if !rel.is_empty() {
                std::fs::create_dir_all(work_root.path().join(rel))?;
            }
        }

        let limits = manifest.policy.limits;
        let vfs = Arc::new(SandboxFs::new(
            work_root.path(),
            FsEnforcer::new(manifest.policy.filesystem.clone()),
        )?);
        let net = match manifest.policy.network.clone() {
            Some(policy) => {
                let client = reqwest::Client::builder()
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
                    .map_err(|e| RuntimeError::Engine(format!("http client: {e}")))?;
                Some((NetworkEnforcer::new(policy), client))
            },
            None => None,
        };

        let started = Instant::now();
        let deadline = Duration::from_millis(limits.timeout_ms);
        let timed_out = Arc::new(AtomicBool::new(false));
        let output = Arc::new(std::sync::Mutex::new(OutputState::new(limits)));

        let engine = AsyncRuntime::new()?;
        engine
            .set_memory_limit(usize::try_from(limits.mem_mb).unwrap_or(256) * 1024 * 1024)
            .await;
        {
            let timed_out = Arc::clone(&timed_out);
            engine
                .set_interrupt_handler(Some(Box::new(move || {
                    if started.elapsed() >= deadline {
                        timed_out.store(true, Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                })))
                .await;
        }

        let context = AsyncContext::full(&engine).await?;

        let install = InstallState {
            vfs: Arc::clone(&vfs),
            net,
            mcp: self.mcp.clone(),
            sinks: sinks.clone(),
            output: Arc::clone(&output),
        };

        debug!(capsule = %hash, "starting sandboxed run");
        let eval_error: Option<String> = async_with!(context => |ctx| {
            if let Err(e) = install.install(&ctx) {
                return Some(format!("bridge setup: {e}"));
            }
            if let Err(e) = ctx.eval::<(), _>(BOOTSTRAP).catch(&ctx) {
                return Some(e.to_string());
            }
            if let Err(e) = ctx.eval::<(), _>(entry_source.as_bytes().to_vec()).catch(&ctx) {
                return Some(e.to_string());
            }
            if let Err(e) = ctx.eval::<(), _>(FINALIZER).catch(&ctx) {
                return Some(e.to_string());
            }
            None
        })
        .await;

        let outcome = if let Some(message) = eval_error {
            self.fail(&message, started, &timed_out, &output, &sinks)
        } else {
            // Drive pending jobs (microtasks, host bridge futures) until
            // the result promise settles or the wall clock runs out.
            let remaining = deadline.saturating_sub(started.elapsed());
            let idled = tokio::time::timeout(remaining, engine.idle()).await;
            if idled.is_err() {
                timed_out.store(true, Ordering::Relaxed);
                self.fail("interrupted", started, &timed_out, &output, &sinks)
            } else {
                let settled: Option<String> =
                    async_with!(context => |ctx| {
                        ctx.eval::<Option<String>, _>("globalThis.__settled")
                            .ok()
                            .flatten()
                    })
                    .await;
                self.settle(settled, started, &timed_out, &output, &sinks)
            }
        };

        // Dispose the engine before the work root so no file handles leak
        // into the TempDir removal.
        drop(context);
        drop(engine);

        Ok(outcome)
    }

    fn settle(
        &self,
        settled: Option<String>,
        started: Instant,
        timed_out: &AtomicBool,
        output: &std::sync::Mutex<OutputState>,
        sinks: &RunSinks,
    ) -> RunOutcome {
        let usage = usage_since(started);
        let Some(settled) = settled else {
            // The promise never settled but nothing is left to run; treat
            // as a completed run with no value.
            return RunOutcome {
                exit_code: 0,
                last_value: None,
                usage,
            };
        };

        match serde_json::from_str::<Value>(&settled) {
            Ok(record) if record["ok"].as_bool() == Some(true) => RunOutcome {
                exit_code: 0,
                last_value: record["value"].as_str().map(ToString::to_string),
                usage,
            },
            Ok(record) => {
                let message = record["error"].as_str().unwrap_or("unknown error").to_string();
                self.fail(&message, started, timed_out, output, sinks)
            },
            Err(_) => self.fail("malformed result record", started, timed_out, output, sinks),
        }
    }

    /// Map a failure message onto an exit code and emit the diagnostic.
    fn fail(
        &self,
        message: &str,
        started: Instant,
        timed_out: &AtomicBool,
        output: &std::sync::Mutex<OutputState>,
        sinks: &RunSinks,
    ) -> RunOutcome {
        let usage = usage_since(started);
        let overflowed = output.lock().map(|o| o.overflowed).unwrap_or(false);

        let (exit_code, diagnostic) = if timed_out.load(Ordering::Relaxed) {
            (EXIT_TIMEOUT, "timeout: wall clock limit exceeded".to_string())
        } else if message.contains("out of memory") {
            (EXIT_MEMORY, format!("memory limit exceeded: {message}"))
        } else if overflowed {
            (1, "output limit exceeded".to_string())
        } else {
            (1, message.to_string())
        };

        (sinks.stderr)(format!("{diagnostic}\n").as_bytes());
        RunOutcome {
            exit_code,
            last_value: None,
            usage,
        }
    }
}

impl std::fmt::Debug for JsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsRuntime").finish_non_exhaustive()
    }
}

fn usage_since(started: Instant) -> RunUsage {
    RunUsage {
        wall_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        mem_bytes: None,
    }
}

/// Output accounting: stdout bounded by `stdout_bytes`, stderr by twice it.
struct OutputState {
    stdout_used: u64,
    stderr_used: u64,
    stdout_max: u64,
    stderr_max: u64,
    overflowed: bool,
}

impl OutputState {
    fn new(limits: Limits) -> Self {
        Self {
            stdout_used: 0,
            stderr_used: 0,
            stdout_max: limits.stdout_bytes,
            stderr_max: limits.stdout_bytes.saturating_mul(2),
            overflowed: false,
        }
    }

    /// Account `len` bytes on one stream; false means the cap is blown.
    fn admit(&mut self, len: u64, is_err: bool) -> bool {
        let (used, max) = if is_err {
            (&mut self.stderr_used, self.stderr_max)
        } else {
            (&mut self.stdout_used, self.stdout_max)
        };
        if used.saturating_add(len) > max {
            self.overflowed = true;
            return false;
        }
        *used = used.saturating_add(len);
        true
    }
}

/// Everything the bridge installer captures.
struct InstallState {
    vfs: Arc<SandboxFs>,
    net: Option<(NetworkEnforcer, reqwest::Client)>,
    mcp: Option<Arc<dyn McpBridge>>,
    sinks: RunSinks,
    output: Arc<std::sync::Mutex<OutputState>>,
}

impl InstallState {
    fn install(&self, ctx: &rquickjs::Ctx<'_>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        // __print(text, isErr) -> bool; false tells the bootstrap to throw.
        {
            let output = Arc::clone(&self.output);
            let sinks = self.sinks.clone();
            globals.set(
                "__print",
                Func::from(move |text: String, is_err: bool| -> bool {
                    let Ok(mut state) = output.lock() else {
                        return false;
                    };
                    if !state.admit(text.len() as u64, is_err) {
                        return false;
                    }
                    let sink = if is_err { &sinks.stderr } else { &sinks.stdout };
                    sink(text.as_bytes());
                    true
                }),
            )?;
        }

        // Filesystem bridges. Each wraps one VFS call into an awaitable
        // that resolves to a JSON envelope.
        {
            let vfs = Arc::clone(&self.vfs);
            globals.set(
                "__vfs_read",
                Func::from(Async(move |path: String, opts: String| {
                    let vfs = Arc::clone(&vfs);
                    async move { Ok::<String, rquickjs::Error>(vfs_read(&vfs, &path, &opts).await) }
                })),
            )?;
        }
        {
            let vfs = Arc::clone(&self.vfs);
            globals.set(
                "__vfs_write",
                Func::from(Async(move |path: String, spec: String| {
                    let vfs = Arc::clone(&vfs);
                    async move { Ok::<String, rquickjs::Error>(vfs_write(&vfs, &path, &spec).await) }
                })),
            )?;
        }
        {
            let vfs = Arc::clone(&self.vfs);
            globals.set(
                "__vfs_readdir",
                Func::from(Async(move |path: String| {
                    let vfs = Arc::clone(&vfs);
                    async move {
                        Ok::<String, rquickjs::Error>(match vfs.read_dir(&path).await {
                            Ok(entries) => ok_env(serde_json::to_value(entries).unwrap_or(Value::Null)),
                            Err(e) => err_env(&e.to_string()),
                        })
                    }
                })),
            )?;
        }
        {
            let vfs = Arc::clone(&self.vfs);
            globals.set(
                "__vfs_mkdir",
                Func::from(Async(move |path: String| {
                    let vfs = Arc::clone(&vfs);
                    async move {
                        Ok::<String, rquickjs::Error>(match vfs.mkdir(&path).await {
                            Ok(()) => ok_env(Value::Null),
                            Err(e) => err_env(&e.to_string()),
                        })
                    }
                })),
            )?;
        }
        {
            let vfs = Arc::clone(&self.vfs);
            globals.set(
                "__vfs_exists",
                Func::from(Async(move |path: String| {
                    let vfs = Arc::clone(&vfs);
                    async move {
                        Ok::<String, rquickjs::Error>(match vfs.exists(&path).await {
                            Ok(exists) => ok_env(Value::Bool(exists)),
                            Err(e) => err_env(&e.to_string()),
                        })
                    }
                })),
            )?;
        }
        if self.vfs.supports_stat() {
            let vfs = Arc::clone(&self.vfs);
            globals.set(
                "__vfs_stat",
                Func::from(Async(move |path: String| {
                    let vfs = Arc::clone(&vfs);
                    async move {
                        Ok::<String, rquickjs::Error>(match vfs.stat(&path).await {
                            Ok(stat) => ok_env(serde_json::to_value(stat).unwrap_or(Value::Null)),
                            Err(e) => err_env(&e.to_string()),
                        })
                    }
                })),
            )?;
        }

        // Guarded fetch, only when the intersected policy carries a
        // network record.
        if let Some((enforcer, client)) = &self.net {
            let enforcer = enforcer.clone();
            let client = client.clone();
            globals.set(
                "__fetch",
                Func::from(Async(move |url: String, init: String| {
                    let enforcer = enforcer.clone();
                    let client = client.clone();
                    async move {
                        let init: FetchInit = serde_json::from_str(&init).unwrap_or_default();
                        Ok::<String, rquickjs::Error>(
                            match guarded_fetch(&client, &enforcer, &url, init).await {
                                Ok(value) => ok_env(value),
                                Err(message) => err_env(&message),
                            },
                        )
                    }
                })),
            )?;
        }

        // MCP proxies.
        if let Some(bridge) = &self.mcp {
            let names = serde_json::to_string(&bridge.names()).unwrap_or_else(|_| "[]".into());
            globals.set("__mcp_names", names)?;

            let bridge = Arc::clone(bridge);
            globals.set(
                "__mcp_call",
                Func::from(Async(move |mcp: String, method: String, params: String| {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        let params: Value =
                            serde_json::from_str(&params).unwrap_or(Value::Null);
                        Ok::<String, rquickjs::Error>(
                            match bridge.call(&mcp, &method, params).await {
                                Ok(value) => ok_env(value),
                                Err(message) => err_env(&message),
                            },
                        )
                    }
                })),
            )?;
        }

        Ok(())
    }
}

fn ok_env(value: Value) -> String {
    json!({ "ok": true, "value": value }).to_string()
}

fn err_env(message: &str) -> String {
    json!({ "ok": false, "error": message }).to_string()
}

async fn vfs_read(vfs: &SandboxFs, path: &str, opts: &str) -> String {
    let opts: ReadOptions = serde_json::from_str(opts).unwrap_or_default();
    match vfs.read_file(path, opts).await {
        Ok(ReadOutput::Text(text)) => ok_env(Value::String(text)),
        Ok(ReadOutput::Bytes(bytes)) => {
            use base64::Engine as _;
            ok_env(json!({
                "base64": base64::engine::general_purpose::STANDARD.encode(bytes)
            }))
        },
        Err(e) => err_env(&e.to_string()),
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteSpec {
    data: String,
    #[serde(default)]
    mode: WriteMode,
    #[serde(default)]
    binary: bool,
}

async fn vfs_write(vfs: &SandboxFs, path: &str, spec: &str) -> String {
    let spec: WriteSpec = match serde_json::from_str(spec) {
        Ok(spec) => spec,
        Err(e) => return err_env(&format!("invalid write options: {e}")),
    };
    let bytes = if spec.binary {
        use base64::Engine as _;
        match base64::engine::general_purpose::STANDARD.decode(&spec.data) {
            Ok(bytes) => bytes,
            Err(_) => return err_env("binary write data must be base64"),
        }
    } else {
        spec.data.into_bytes()
    };

    match vfs.write_file(path, &bytes, spec.mode).await {
        Ok(()) => ok_env(Value::Null),
        Err(e) => err_env(&e.to_string()),
    }
}

/// Builds the guest-visible surface from the low-level host bridges. The
/// host never hands out object references; everything crosses as JSON.
const BOOTSTRAP: &str = r#"(function () {
  "use strict";
  const enc = (v) => JSON.stringify(v === undefined ? null : v);
  const unwrap = (raw) => {
    const res = JSON.parse(raw);
    if (!res.ok) { throw new Error(res.error); }
    return res.value;
  };
  const emit = (text, isErr) => {
    if (!__print(text, isErr)) { throw new Error("output limit exceeded"); }
  };
  const join = (args) => args.map((a) => {
    if (typeof a === "string") { return a; }
    try { return JSON.stringify(a); } catch (e) { return String(a); }
  }).join(" ");

  globalThis.console = {
    log: (...args) => emit(join(args) + "\n", false),
    info: (...args) => emit(join(args) + "\n", false),
    warn: (...args) => emit(join(args) + "\n", true),
    error: (...args) => emit(join(args) + "\n", true),
  };

  const fs = {
    read: async (path, opts) => unwrap(await __vfs_read(path, enc(opts || {}))),
    write: async (path, data, opts) =>
      unwrap(await __vfs_write(path, enc(Object.assign({ data: data }, opts || {})))),
    readdir: async (path) => unwrap(await __vfs_readdir(path)),
    mkdir: async (path) => unwrap(await __vfs_mkdir(path)),
    exists: async (path) => unwrap(await __vfs_exists(path)),
  };
  if (typeof __vfs_stat === "function") {
    fs.stat = async (path) => unwrap(await __vfs_stat(path));
  }
  globalThis.fs = fs;

  if (typeof __fetch === "function") {
    globalThis.fetch = async (url, init) => {
      const r = unwrap(await __fetch(String(url), enc(init || {})));
      return {
        status: r.status,
        ok: r.status >= 200 && r.status < 300,
        headers: r.headers,
        text: async () => r.body,
        json: async () => JSON.parse(r.body),
      };
    };
  }

  if (typeof __mcp_names === "string") {
    for (const name of JSON.parse(__mcp_names)) {
      globalThis[name] = new Proxy({}, {
        get: (_target, prop) => {
          if (typeof prop !== "string") { return undefined; }
          return async (params) => unwrap(await __mcp_call(name, prop, enc(params)));
        },
      });
    }
  }
})();
"#;

/// Records how the entry's result promise settled, as a JSON string on
/// `globalThis.__settled`. Objects serialize to JSON, primitives
/// stringify, `undefined` yields no value.
const FINALIZER: &str = r#"(function () {
  const record = (obj) => { globalThis.__settled = JSON.stringify(obj); };
  const p = globalThis.__capsule_result;
  if (typeof p === "undefined") { record({ ok: true, value: null }); return; }
  Promise.resolve(p).then(
    (v) => {
      let out = null;
      if (typeof v !== "undefined") {
        out = (typeof v === "object" && v !== null) ? JSON.stringify(v) : String(v);
      }
      record({ ok: true, value: out });
    },
    (e) => {
      record({ ok: false, error: String(e && e.message !== undefined ? e.message : e) });
    }
  );
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use waygate_capsule::{CapsuleBuilder, RunRequest};
    use waygate_crypto::KeyPair;
    use waygate_policy::{Policy, PolicyOverride};

    struct Fixture {
        _cache: tempfile::TempDir,
        builder: CapsuleBuilder,
        runtime: JsRuntime,
    }

    fn fixture() -> Fixture {
        let cache = tempfile::tempdir().unwrap();
        let builder = CapsuleBuilder::new(
            cache.path(),
            Policy::server_default(),
            Vec::new(),
            Arc::new(KeyPair::generate()),
        );
        let runtime = JsRuntime::new(CapsuleStore::new(cache.path()));
        Fixture {
            _cache: cache,
            builder,
            runtime,
        }
    }

    fn capture() -> (RunSinks, Arc<Mutex<Vec<u8>>>, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let err = Arc::new(Mutex::new(Vec::new()));
        let sink_out = Arc::clone(&out);
        let sink_err = Arc::clone(&err);
        let sinks = RunSinks {
            stdout: Arc::new(move |bytes| sink_out.lock().unwrap().extend_from_slice(bytes)),
            stderr: Arc::new(move |bytes| sink_err.lock().unwrap().extend_from_slice(bytes)),
        };
        (sinks, out, err)
    }

    async fn run(fixture: &Fixture, req: RunRequest) -> (RunOutcome, String, String) {
        let built = fixture.builder.build(&req).await.unwrap();
        let (sinks, out, err) = capture();
        let outcome = fixture.runtime.execute(&built.hash, sinks).await.unwrap();
        let stdout = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        let stderr = String::from_utf8(err.lock().unwrap().clone()).unwrap();
        (outcome, stdout, stderr)
    }

    fn req(code: &str) -> RunRequest {
        RunRequest {
            code: code.to_string(),
            ..RunRequest::default()
        }
    }

    #[tokio::test]
    async fn hello_world_streams_stdout() {
        let fx = fixture();
        let (outcome, stdout, _) = run(&fx, req("console.log('hello')")).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(stdout, "hello\n");
    }

    #[tokio::test]
    async fn last_expression_value_is_returned() {
        let fx = fixture();
        let (outcome, _, _) = run(&fx, req("40+2")).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.last_value.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn objects_serialize_to_json() {
        let fx = fixture();
        let (outcome, _, _) = run(&fx, req("({answer: 42})")).await;
        assert_eq!(outcome.last_value.as_deref(), Some(r#"{"answer":42}"#));
    }

    #[tokio::test]
    async fn infinite_loop_exits_124_with_timeout_on_stderr() {
        let fx = fixture();
        let request = RunRequest {
            policy: Some(
                serde_json::from_str::<PolicyOverride>(r#"{"limits":{"timeoutMs":200}}"#).unwrap(),
            ),
            ..req("while(true){}")
        };
        let (outcome, _, stderr) = run(&fx, request).await;
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(stderr.contains("timeout"), "stderr was: {stderr}");
    }

    #[tokio::test]
    async fn fs_write_then_read_round_trips() {
        let fx = fixture();
        let (outcome, _, stderr) = run(
            &fx,
            req("await fs.write('/tmp/x', 'y'); return await fs.read('/tmp/x')"),
        )
        .await;
        assert_eq!(outcome.exit_code, 0, "stderr: {stderr}");
        assert_eq!(outcome.last_value.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn fs_write_outside_writable_is_denied() {
        let fx = fixture();
        let (outcome, _, stderr) = run(&fx, req("await fs.write('/etc/passwd', 'x')")).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(stderr.contains("filesystem denied"), "stderr: {stderr}");
    }

    #[tokio::test]
    async fn fetch_to_ip_literal_is_denied_with_reason() {
        let fx = fixture();
        let (outcome, _, stderr) = run(&fx, req("await fetch('http://10.0.0.1/')")).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(stderr.contains("IP literals"), "stderr: {stderr}");
    }

    #[tokio::test]
    async fn guest_can_catch_a_policy_denial() {
        let fx = fixture();
        let (outcome, stdout, _) = run(
            &fx,
            req("try { await fetch('http://10.0.0.1/') } catch (e) { console.log('caught:', e.message) } 'done'"),
        )
        .await;
        assert_eq!(outcome.exit_code, 0);
        assert!(stdout.contains("caught:"));
        assert!(stdout.contains("IP literals"));
    }

    #[tokio::test]
    async fn output_limit_aborts_the_run() {
        let fx = fixture();
        let request = RunRequest {
            policy: Some(
                serde_json::from_str::<PolicyOverride>(r#"{"limits":{"stdoutBytes":64}}"#).unwrap(),
            ),
            ..req("for (let i = 0; i < 1000; i++) { console.log('spam line ' + i); }")
        };
        let (outcome, stdout, stderr) = run(&fx, request).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(stdout.len() <= 64);
        assert!(stderr.contains("output limit exceeded"), "stderr: {stderr}");
    }

    #[tokio::test]
    async fn under_limit_output_never_trips_the_cap() {
        let fx = fixture();
        let (outcome, stdout, _) = run(&fx, req("console.log('a'.repeat(100))")).await;
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(stdout.len(), 101);
    }

    #[tokio::test]
    async fn guest_throw_is_exit_one_with_message() {
        let fx = fixture();
        let (outcome, _, stderr) = run(&fx, req("throw new Error('boom')")).await;
        assert_eq!(outcome.exit_code, 1);
        assert!(stderr.contains("boom"), "stderr: {stderr}");
    }

    #[tokio::test]
    async fn stdin_rides_in_the_code_layer() {
        let fx = fixture();
        let request = RunRequest {
            stdin: Some("piped input".to_string()),
            ..req("return await fs.read('/_stdin.txt')")
        };
        let (outcome, _, stderr) = run(&fx, request).await;
        assert_eq!(outcome.exit_code, 0, "stderr: {stderr}");
        assert_eq!(outcome.last_value.as_deref(), Some("piped input"));
    }

    #[tokio::test]
    async fn runs_do_not_share_state() {
        let fx = fixture();
        let (first, _, _) = run(&fx, req("globalThis.leak = 7; 'set'")).await;
        assert_eq!(first.last_value.as_deref(), Some("set"));

        let (second, _, _) = run(&fx, req("typeof globalThis.leak")).await;
        assert_eq!(second.last_value.as_deref(), Some("undefined"));
    }

    struct EchoBridge;

    #[async_trait::async_trait]
    impl McpBridge for EchoBridge {
        fn names(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        async fn call(
            &self,
            _mcp: &str,
            method: &str,
            params: Value,
        ) -> Result<Value, String> {
            Ok(json!({ "method": method, "params": params }))
        }
    }

    #[tokio::test]
    async fn mcp_proxy_routes_method_calls() {
        let fx = fixture();
        let runtime = JsRuntime::new(CapsuleStore::new(fx.builder.cache_dir()))
            .with_mcp(Arc::new(EchoBridge));

        let built = fx
            .builder
            .build(&req("const r = await echo.search({q: 1}); return r.method"))
            .await
            .unwrap();
        let (sinks, _, err) = capture();
        let outcome = runtime.execute(&built.hash, sinks).await.unwrap();
        let stderr = String::from_utf8(err.lock().unwrap().clone()).unwrap();
        assert_eq!(outcome.exit_code, 0, "stderr: {stderr}");
        assert_eq!(outcome.last_value.as_deref(), Some("search"));
    }
}
