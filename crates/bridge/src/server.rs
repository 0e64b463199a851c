//! The outward-facing MCP server on the bridge's own stdio.
//!
//! Newline-delimited JSON-RPC 2.0. The tool surface is a single `run_python`
//! entry whose schema stays near-constant in size: downstream catalogs are
//! reachable only through the in-sandbox discovery helpers and the
//! capability resource, never inlined here.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::bridge::Bridge;
use crate::discovery::{CAPABILITY_RESOURCE_URI, SANDBOX_HELPERS_SUMMARY};
use crate::error::BridgeError;
use crate::render::{self, RunOutcome, RunStatus};

const JSONRPC_PARSE_ERROR: i64 = -32700;
const JSONRPC_INVALID_PARAMS: i64 = -32602;
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

const CAPABILITY_RESOURCE_NAME: &str = "code-execution-capabilities";
const CAPABILITY_RESOURCE_TITLE: &str = "Code Execution Sandbox Helpers";
const CAPABILITY_RESOURCE_DESCRIPTION: &str = "Capability overview, helper reference, and sandbox usage notes (call \
     runtime.capability_summary() inside the sandbox for this text).";

fn capability_resource_text() -> String {
    format!(
        "# Code Execution MCP Capabilities\n\n\
         {SANDBOX_HELPERS_SUMMARY}\n\n\
         ## Quick usage\n\n\
         - Pass `servers=[...]` to mount MCP proxies (`mcp_<alias>` modules).\n\
         - Import `mcp.runtime as runtime`; call `runtime.capability_summary()` instead of \
         rereading this resource for the same hint.\n\
         - Prefer the `_sync` helpers first to read cached metadata before issuing RPCs.\n\
         - Server configs support a `cwd` field; check `runtime.describe_server(name)` before \
         assuming a working directory.\n\n\
         Resource URI: {CAPABILITY_RESOURCE_URI}"
    )
}

/// Serves MCP over the process's stdin/stdout until EOF.
pub async fn serve(bridge: Arc<Bridge>) -> anyhow::Result<()> {
    serve_io(bridge, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn serve_io<R, W>(bridge: Arc<Bridge>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut reader = tokio::io::BufReader::new(reader);

    loop {
        let line = match sandbox_jsonrpc::read_line_limited(&mut reader, MAX_REQUEST_BYTES).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "failed to read request line");
                break;
            }
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let message: Value = match serde_json::from_slice(&line) {
            Ok(message) => message,
            Err(err) => {
                write_message(
                    &writer,
                    &error_response(Value::Null, JSONRPC_PARSE_ERROR, &format!("parse error: {err}")),
                )
                .await;
                continue;
            }
        };

        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = id else {
            // Notification; nothing requires action.
            tracing::debug!(method, "notification");
            continue;
        };

        match method.as_str() {
            "initialize" => {
                let result = serde_json::json!({
                    "protocolVersion": crate::client::MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {}, "resources": {} },
                    "serverInfo": {
                        "name": "mcp-sandbox-bridge",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                });
                write_message(&writer, &ok_response(id, result)).await;
            }
            "ping" => {
                write_message(&writer, &ok_response(id, serde_json::json!({}))).await;
            }
            "tools/list" => {
                let result = serde_json::json!({ "tools": [run_python_tool(&bridge)] });
                write_message(&writer, &ok_response(id, result)).await;
            }
            "tools/call" => {
                // Invocations may overlap; each runs on its own task and the
                // response goes out through the shared writer lock.
                let bridge = bridge.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let result = handle_tool_call(&bridge, params).await;
                    write_message(&writer, &ok_response(id, result)).await;
                });
            }
            "resources/list" => {
                let text = capability_resource_text();
                let result = serde_json::json!({
                    "resources": [{
                        "name": CAPABILITY_RESOURCE_NAME,
                        "title": CAPABILITY_RESOURCE_TITLE,
                        "description": CAPABILITY_RESOURCE_DESCRIPTION,
                        "uri": CAPABILITY_RESOURCE_URI,
                        "mimeType": "text/markdown",
                        "size": text.len(),
                    }],
                });
                write_message(&writer, &ok_response(id, result)).await;
            }
            "resources/read" => {
                let uri = params.get("uri").and_then(|u| u.as_str()).unwrap_or("");
                if uri == CAPABILITY_RESOURCE_URI {
                    let result = serde_json::json!({
                        "contents": [{
                            "uri": CAPABILITY_RESOURCE_URI,
                            "mimeType": "text/markdown",
                            "text": capability_resource_text(),
                        }],
                    });
                    write_message(&writer, &ok_response(id, result)).await;
                } else {
                    write_message(
                        &writer,
                        &error_response(
                            id,
                            JSONRPC_INVALID_PARAMS,
                            &format!("unknown resource: {uri}"),
                        ),
                    )
                    .await;
                }
            }
            other => {
                write_message(
                    &writer,
                    &error_response(
                        id,
                        JSONRPC_METHOD_NOT_FOUND,
                        &format!("method not found: {other}"),
                    ),
                )
                .await;
            }
        }
    }

    bridge.shutdown().await;
    Ok(())
}

fn run_python_tool(bridge: &Bridge) -> Value {
    let settings = bridge.settings();
    serde_json::json!({
        "name": "run_python",
        "description": format!(
            "Execute Python code inside a rootless container sandbox. Use the optional \
             'servers' array to load MCP servers for this execution. {SANDBOX_HELPERS_SUMMARY}"
        ),
        "inputSchema": {
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source code to execute.",
                },
                "servers": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional list of MCP servers to make available as mcp_<alias> proxies",
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": settings.max_timeout,
                    "default": settings.default_timeout,
                    "description": "Execution timeout in seconds",
                },
            },
            "required": ["code"],
        },
    })
}

async fn handle_tool_call(bridge: &Bridge, params: Value) -> Value {
    let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    let outcome = if name != "run_python" {
        invalid(&format!("unknown tool: {name}"))
    } else {
        match parse_run_python_arguments(&arguments) {
            Ok((code, servers, timeout)) => bridge.run_python(&code, &servers, timeout).await,
            Err(outcome) => outcome,
        }
    };

    let rendered = render::render(&outcome, bridge.settings().output_mode);
    serde_json::json!({
        "content": [{ "type": "text", "text": rendered.text }],
        "structuredContent": rendered.structured,
        "isError": rendered.is_error,
    })
}

type RunPythonArguments = (String, Vec<String>, Option<i64>);

fn parse_run_python_arguments(arguments: &Value) -> Result<RunPythonArguments, RunOutcome> {
    let code = match arguments.get("code") {
        Some(Value::String(code)) => code.clone(),
        _ => return Err(invalid("missing 'code' argument")),
    };

    let servers = match arguments.get("servers") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut servers = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(server) => servers.push(server.to_string()),
                    None => return Err(invalid("'servers' must be a list of strings")),
                }
            }
            servers
        }
        Some(_) => return Err(invalid("'servers' must be a list")),
    };

    let timeout = match arguments.get("timeout") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_i64() {
            Some(timeout) => Some(timeout),
            None => return Err(invalid("'timeout' must be an integer")),
        },
    };

    Ok((code, servers, timeout))
}

fn invalid(message: &str) -> RunOutcome {
    let tagged = BridgeError::InvalidRequest(message.to_string())
        .tagged()
        .to_string();
    RunOutcome {
        status: RunStatus::Error,
        stdout: String::new(),
        stderr: tagged.clone(),
        error: Some(tagged),
        servers: Vec::new(),
    }
}

fn ok_response(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

async fn write_message(
    writer: &Arc<tokio::sync::Mutex<impl AsyncWrite + Unpin>>,
    message: &Value,
) {
    let mut line = serde_json::to_string(message).unwrap_or_default();
    line.push('\n');
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write_all(line.as_bytes()).await {
        tracing::debug!(%err, "failed to write response");
        return;
    }
    let _ = writer.flush().await;
}
