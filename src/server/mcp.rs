//! MCP JSON-RPC endpoint
//!
//! Exposes a single tool, `request_approval`. The call blocks until a
//! decision arrives; a client that drops the connection drops the
//! handler future, which releases the parked wait.

use super::AppState;
use crate::error::HitlError;
use crate::gateway::{CallContext, ToolRequest};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const TOOL_NAME: &str = "request_approval";

/// Primary session header, then the MCP transport's own
pub const SESSION_HEADERS: &[&str] = &["x-session-id", "mcp-session-id"];

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

pub fn routes() -> Router<AppState> {
    Router::new().route("/mcp", post(handle))
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    SESSION_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn rpc_result(id: Value, result: Value) -> Response {
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response()
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    }))
    .into_response()
}

fn text_content(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

pub fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Request human approval before running a tool",
        "inputSchema": {
            "type": "object",
            "properties": {
                "tool_name": { "type": "string", "description": "Name of the tool to run" },
                "input": { "type": "object", "description": "Input the tool will run with" },
                "tool_use_id": { "type": "string", "description": "Unique id of this tool use" }
            },
            "required": ["tool_name", "input", "tool_use_id"]
        }
    })
}

async fn handle(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return rpc_error(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)),
    };

    // notifications get no response body
    let Some(id) = request.id else {
        tracing::debug!(method = %request.method, "MCP notification");
        return StatusCode::ACCEPTED.into_response();
    };

    match request.method.as_str() {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "a3s-hitl", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "ping" => rpc_result(id, json!({})),
        "tools/list" => rpc_result(id, json!({ "tools": [tool_definition()] })),
        "tools/call" => call_tool(&state, &headers, id, request.params).await,
        other => rpc_error(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    }
}

async fn call_tool(state: &AppState, headers: &HeaderMap, id: Value, params: Value) -> Response {
    let params: CallParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return rpc_error(id, INVALID_PARAMS, format!("Invalid params: {}", e)),
    };
    if params.name != TOOL_NAME {
        return rpc_error(id, INVALID_PARAMS, format!("Unknown tool: {}", params.name));
    }
    let request: ToolRequest = match serde_json::from_value(params.arguments) {
        Ok(request) => request,
        Err(e) => return rpc_error(id, INVALID_PARAMS, format!("Invalid arguments: {}", e)),
    };

    let ctx = CallContext::new(session_from_headers(headers))
        .with_cancel(state.shutdown.child_token());

    match state.gateway.request_approval(&ctx, request).await {
        Ok(response) => match serde_json::to_string(&response) {
            Ok(text) => rpc_result(id, text_content(text, false)),
            Err(e) => rpc_result(id, text_content(HitlError::from(e).to_string(), true)),
        },
        Err(e) => {
            tracing::warn!(error = %e, "request_approval failed");
            rpc_result(id, text_content(e.to_string(), true))
        }
    }
}
