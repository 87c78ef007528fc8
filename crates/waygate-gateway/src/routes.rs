//! Route table and HTTP handlers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use futures::stream::Stream;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::warn;
use waygate_capsule::CapsuleError;
use waygate_core::{CapsuleHash, ExecutionEvent, RunId, SessionId};

use crate::context::GatewayContext;
use crate::error::GatewayError;
use crate::rpc;

/// Build the gateway router. CORS is permissive: the browser executor is
/// the intended client.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_rpc))
        .route("/session", post(session_create))
        .route("/session/{id}/events", get(session_events))
        .route("/session/{id}/result", post(session_result))
        .route("/capsules/{hash}/{file}", get(capsule_file))
        .route("/mcps-rpc", post(mcps_rpc))
        .route("/mcps/{name}/tools", get(mcps_tools))
        .route("/healthz", get(healthz))
        .route("/", get(index))
        .with_state(ctx)
        .layer(CorsLayer::permissive())
}

async fn mcp_rpc(State(ctx): State<Arc<GatewayContext>>, body: String) -> Response {
    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(rpc::rpc_error(Value::Null, -32600, "body is not JSON")),
        )
            .into_response();
    };
    let response = rpc::handle(&ctx, request).await;
    axum::Json(response).into_response()
}

async fn session_create(State(ctx): State<Arc<GatewayContext>>) -> Response {
    let (session_id, attach_token) = ctx.dispatcher.create_session();
    axum::Json(json!({ "sessionId": session_id, "attachToken": attach_token })).into_response()
}

async fn session_events(
    State(ctx): State<Arc<GatewayContext>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Ok(session_id) = id.parse::<SessionId>() else {
        return problem(StatusCode::BAD_REQUEST, "invalid session id");
    };
    let Some(token) = query.get("token") else {
        return problem(StatusCode::FORBIDDEN, "missing attach token");
    };

    let rx = match ctx.dispatcher.attach(&session_id, token) {
        Ok(rx) => rx,
        Err(GatewayError::UnknownSession(_)) => {
            return problem(StatusCode::NOT_FOUND, "unknown session");
        },
        Err(e) => return problem(StatusCode::FORBIDDEN, &e.to_string()),
    };

    let stream = command_stream(Arc::clone(&ctx), session_id, rx);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)))
        .into_response()
}

/// Serialize dispatcher commands as SSE `data:` frames; detach the session
/// when the browser goes away and the stream drops.
fn command_stream(
    ctx: Arc<GatewayContext>,
    session_id: SessionId,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::session::SessionCommand>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    struct DetachGuard {
        ctx: Arc<GatewayContext>,
        session_id: SessionId,
    }
    impl Drop for DetachGuard {
        fn drop(&mut self) {
            self.ctx.dispatcher.detach(&self.session_id);
        }
    }

    async_stream::stream! {
        let _guard = DetachGuard { ctx, session_id };
        while let Some(command) = rx.recv().await {
            let data = serde_json::to_string(&command).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultBody {
    run_id: RunId,
    event: ExecutionEvent,
}

async fn session_result(
    State(ctx): State<Arc<GatewayContext>>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<ResultBody>,
) -> Response {
    let Ok(session_id) = id.parse::<SessionId>() else {
        return problem(StatusCode::BAD_REQUEST, "invalid session id");
    };
    match ctx.dispatcher.add_result(&session_id, body.run_id, body.event) {
        Ok(()) => axum::Json(json!({ "ok": true })).into_response(),
        Err(GatewayError::UnknownSession(_)) => problem(StatusCode::NOT_FOUND, "unknown session"),
        Err(e) => problem(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn capsule_file(
    State(ctx): State<Arc<GatewayContext>>,
    Path((hash, file)): Path<(String, String)>,
) -> Response {
    let Ok(hash) = hash.parse::<CapsuleHash>() else {
        return problem(StatusCode::BAD_REQUEST, "invalid capsule hash");
    };

    match ctx.store.file_bytes(&hash, &file) {
        Ok(bytes) => {
            let content_type = if file.ends_with(".json") {
                "application/json"
            } else {
                "application/zip"
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        },
        Err(CapsuleError::Validation(message)) => problem(StatusCode::BAD_REQUEST, &message),
        Err(CapsuleError::NotFound(_)) => problem(StatusCode::NOT_FOUND, "no such capsule file"),
        Err(e) => {
            warn!(error = %e, "capsule file read failed");
            problem(StatusCode::INTERNAL_SERVER_ERROR, "capsule read failed")
        },
    }
}

#[derive(Debug, serde::Deserialize)]
struct UpstreamRpcBody {
    mcp: String,
    method: String,
    #[serde(default)]
    params: Value,
}

async fn mcps_rpc(
    State(ctx): State<Arc<GatewayContext>>,
    axum::Json(body): axum::Json<UpstreamRpcBody>,
) -> Response {
    match ctx.upstreams.rpc(&body.mcp, &body.method, body.params).await {
        Ok(result) => axum::Json(json!({ "result": result })).into_response(),
        Err(waygate_mcp::McpError::UnknownUpstream(name)) => {
            problem(StatusCode::NOT_FOUND, &format!("unknown MCP: {name}"))
        },
        Err(waygate_mcp::McpError::Timeout { .. }) => {
            problem(StatusCode::REQUEST_TIMEOUT, "upstream timed out")
        },
        Err(e) => problem(StatusCode::FAILED_DEPENDENCY, &e.to_string()),
    }
}

async fn mcps_tools(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Response {
    match ctx.upstreams.list_tools(&name).await {
        Ok(tools) => axum::Json(tools).into_response(),
        Err(waygate_mcp::McpError::UnknownUpstream(_)) => {
            problem(StatusCode::NOT_FOUND, &format!("unknown MCP: {name}"))
        },
        Err(e) => problem(StatusCode::FAILED_DEPENDENCY, &e.to_string()),
    }
}

async fn healthz() -> Response {
    axum::Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

async fn index(State(ctx): State<Arc<GatewayContext>>) -> Response {
    if ctx.no_ui {
        return problem(StatusCode::NOT_FOUND, "ui disabled");
    }
    Html(
        "<!doctype html><html><head><title>waygate</title></head>\
         <body><h1>waygate</h1><p>MCP gateway is running. \
         POST JSON-RPC to <code>/mcp</code>.</p></body></html>",
    )
    .into_response()
}

fn problem(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}
