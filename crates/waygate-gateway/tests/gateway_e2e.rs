//! End-to-end tests against a gateway bound to an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde_json::{Value, json};
use waygate_config::GatewayConfig;
use waygate_gateway::GatewayContext;

struct TestGateway {
    base: String,
    ctx: Arc<GatewayContext>,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

async fn spawn_gateway() -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.signing_key_path = dir.path().join("keys");
    config.cache_dir = dir.path().join("capsules");

    let ctx = GatewayContext::initialize(config, false).unwrap();
    let app = waygate_gateway::router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        base: format!("http://{addr}"),
        ctx,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestGateway {
    async fn rpc(&self, body: Value) -> Value {
        self.client
            .post(format!("{}/mcp", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn run_js(&self, arguments: Value) -> Value {
        self.rpc(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": "run_js", "arguments": arguments },
        }))
        .await
    }
}

fn content_text(response: &Value) -> &str {
    response["result"]["content"][0]["text"].as_str().unwrap()
}

fn is_error(response: &Value) -> bool {
    response["result"]["isError"].as_bool().unwrap()
}

#[tokio::test]
async fn initialize_advertises_tools() {
    let gw = spawn_gateway().await;
    let response = gw
        .rpc(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }))
        .await;
    assert_eq!(response["result"]["serverInfo"]["name"], "waygate");
    assert!(response["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn tools_list_has_run_js_only() {
    let gw = spawn_gateway().await;
    let response = gw
        .rpc(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "run_js");
    assert_eq!(tools[0]["inputSchema"]["required"], json!(["code"]));
}

#[tokio::test]
async fn simple_js_returns_stdout() {
    let gw = spawn_gateway().await;
    let response = gw.run_js(json!({ "code": "console.log('hello')" })).await;
    assert_eq!(content_text(&response), "hello\n");
    assert!(!is_error(&response));
}

#[tokio::test]
async fn last_value_lands_in_the_content() {
    let gw = spawn_gateway().await;
    let response = gw.run_js(json!({ "code": "40+2" })).await;
    assert!(content_text(&response).contains("42"));
    assert!(!is_error(&response));
}

#[tokio::test]
async fn infinite_loop_times_out_as_an_error_result() {
    let gw = spawn_gateway().await;
    let response = gw
        .run_js(json!({
            "code": "while(true){}",
            "policy": { "limits": { "timeoutMs": 200 } },
        }))
        .await;
    assert!(is_error(&response));
    assert!(content_text(&response).contains("timeout"));
}

#[tokio::test]
async fn ip_literal_fetch_is_denied() {
    let gw = spawn_gateway().await;
    let response = gw
        .run_js(json!({ "code": "await fetch('http://10.0.0.1/')" }))
        .await;
    assert!(is_error(&response));
    assert!(content_text(&response).contains("IP literals"));
}

#[tokio::test]
async fn fs_sandbox_round_trip_and_denial() {
    let gw = spawn_gateway().await;
    let response = gw
        .run_js(json!({
            "code": "await fs.write('/tmp/x', 'y'); return await fs.read('/tmp/x')",
        }))
        .await;
    assert!(!is_error(&response));
    assert_eq!(content_text(&response), "y");

    let denied = gw
        .run_js(json!({ "code": "await fs.write('/etc/passwd', 'y')" }))
        .await;
    assert!(is_error(&denied));
    assert!(content_text(&denied).contains("denied"));
}

#[tokio::test]
async fn identical_requests_reuse_the_capsule() {
    let gw = spawn_gateway().await;
    let args = json!({ "code": "console.log('dedup')" });

    let first = gw.run_js(args.clone()).await;
    assert_eq!(gw.ctx.builder.sign_count(), 1);

    // Find the one capsule and remember its manifest mtime.
    let cache = gw.ctx.builder.cache_dir().to_path_buf();
    let entry = std::fs::read_dir(&cache).unwrap().next().unwrap().unwrap();
    let manifest_path = entry.path().join("capsule.json");
    let mtime_before = std::fs::metadata(&manifest_path).unwrap().modified().unwrap();

    let second = gw.run_js(args).await;
    assert_eq!(first["result"], second["result"]);
    // No re-signing and no manifest rewrite.
    assert_eq!(gw.ctx.builder.sign_count(), 1);
    let mtime_after = std::fs::metadata(&manifest_path).unwrap().modified().unwrap();
    assert_eq!(mtime_before, mtime_after);
}

#[tokio::test]
async fn capsule_files_are_served_and_gated() {
    let gw = spawn_gateway().await;
    gw.run_js(json!({ "code": "1" })).await;

    let cache = gw.ctx.builder.cache_dir().to_path_buf();
    let entry = std::fs::read_dir(&cache).unwrap().next().unwrap().unwrap();
    let hash = entry.file_name().to_string_lossy().into_owned();

    // The served manifest parses and round-trips to the same hash.
    let manifest: Value = gw
        .client
        .get(format!("{}/capsules/{hash}/capsule.json", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(manifest["version"], "1");

    let zip = gw
        .client
        .get(format!("{}/capsules/{hash}/fs.code.zip", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(zip.status(), 200);

    for forbidden in ["signing.key", "capsule.json.bak", "fs..zip", "entry.js"] {
        let status = gw
            .client
            .get(format!("{}/capsules/{hash}/{forbidden}", gw.base))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, 400, "{forbidden} should be refused");
    }
}

#[tokio::test]
async fn malformed_requests_get_json_rpc_errors() {
    let gw = spawn_gateway().await;

    let bad_body = gw
        .client
        .post(format!("{}/mcp", gw.base))
        .body("this is not json")
        .send()
        .await
        .unwrap();
    assert_eq!(bad_body.status(), 400);

    let unknown = gw
        .rpc(json!({ "jsonrpc": "2.0", "id": 3, "method": "no/such/method" }))
        .await;
    assert_eq!(unknown["error"]["code"], -32601);

    let missing_code = gw
        .rpc(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": { "name": "run_js", "arguments": {} },
        }))
        .await;
    assert_eq!(missing_code["error"]["code"], -32602);
}

#[tokio::test]
async fn healthz_answers() {
    let gw = spawn_gateway().await;
    let health: Value = gw
        .client
        .get(format!("{}/healthz", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}

/// A minimal browser executor: attach over SSE, answer every capsule
/// command with one stdout chunk and a clean exit.
async fn fake_executor(base: String, client: reqwest::Client) {
    let session: Value = client
        .post(format!("{base}/session"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sid = session["sessionId"].as_str().unwrap().to_string();
    let token = session["attachToken"].as_str().unwrap().to_string();

    let response = client
        .get(format!("{base}/session/{sid}/events?token={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
        while let Some(frame_end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..frame_end + 2).collect();
            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let command: Value = serde_json::from_str(data).unwrap();
                match command["type"].as_str() {
                    Some("capsule") => {
                        let run_id = command["runId"].clone();
                        let stdout = json!({
                            "runId": run_id,
                            "event": {
                                "type": "stdout",
                                "bytes": BASE64.encode(b"remote says hi\n"),
                            },
                        });
                        client
                            .post(format!("{base}/session/{sid}/result"))
                            .json(&stdout)
                            .send()
                            .await
                            .unwrap();
                        let exit = json!({
                            "runId": run_id,
                            "event": { "type": "exit", "code": 0 },
                        });
                        client
                            .post(format!("{base}/session/{sid}/result"))
                            .json(&exit)
                            .send()
                            .await
                            .unwrap();
                    },
                    Some("shutdown") => return,
                    _ => {},
                }
            }
        }
    }
}

#[tokio::test]
async fn attached_browser_receives_the_dispatch() {
    let gw = spawn_gateway().await;
    tokio::spawn(fake_executor(gw.base.clone(), gw.client.clone()));

    // Wait for the executor to attach.
    let mut waited = Duration::ZERO;
    while gw.ctx.dispatcher.pick_attached().is_none() {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
        assert!(waited < Duration::from_secs(5), "executor never attached");
    }

    let response = gw.run_js(json!({ "code": "console.log('local?')" })).await;
    assert!(!is_error(&response));
    // The browser answered, not the local runtime.
    assert_eq!(content_text(&response), "remote says hi\n");
}

#[tokio::test]
async fn remote_run_times_out_when_the_browser_stays_silent() {
    let gw = spawn_gateway().await;

    // Attach a session whose executor never posts results.
    let session: Value = gw
        .client
        .post(format!("{}/session", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sid = session["sessionId"].as_str().unwrap();
    let token = session["attachToken"].as_str().unwrap();
    let events = gw
        .client
        .get(format!("{}/session/{sid}/events?token={token}", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), 200);
    // Hold the stream open without reading commands.
    let _stream = events.bytes_stream();

    let mut waited = Duration::ZERO;
    while gw.ctx.dispatcher.pick_attached().is_none() {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
        assert!(waited < Duration::from_secs(5), "session never attached");
    }

    let response = gw
        .run_js(json!({
            "code": "1",
            "policy": { "limits": { "timeoutMs": 400 } },
        }))
        .await;
    assert!(is_error(&response));
    assert!(content_text(&response).contains("timeout"));
}

#[tokio::test]
async fn invalid_attach_token_is_refused() {
    let gw = spawn_gateway().await;
    let session: Value = gw
        .client
        .post(format!("{}/session", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sid = session["sessionId"].as_str().unwrap();

    let status = gw
        .client
        .get(format!("{}/session/{sid}/events?token=forged", gw.base))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 403);
}
