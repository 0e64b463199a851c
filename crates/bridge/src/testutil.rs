//! Shared in-memory doubles for unit tests: a scripted MCP server speaking
//! newline JSON-RPC over a duplex pipe, and catalog fixtures.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::client::{DownstreamClient, MCP_PROTOCOL_VERSION};
use crate::config::{Catalog, ServerRecord};
use crate::naming::ServerName;

pub(crate) fn catalog(names: &[&str]) -> Arc<Catalog> {
    let mut servers = BTreeMap::new();
    for name in names {
        let name = ServerName::parse(name).unwrap();
        servers.insert(
            name.clone(),
            ServerRecord {
                name,
                // Fixture records are never spawned; a start attempt must
                // fail deterministically.
                command: "/nonexistent/mcp-test-server".to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
                cwd: None,
            },
        );
    }
    Arc::new(Catalog::new(servers))
}

/// Drives one end of a duplex pipe as an MCP server: answers `initialize`
/// and `tools/list`, echoes `tools/call` arguments back as a text block.
pub(crate) fn scripted_server(
    stream: tokio::io::DuplexStream,
    tools: Vec<Value>,
) -> tokio::task::JoinHandle<()> {
    let (read, mut write) = tokio::io::split(stream);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            let Some(method) = msg.get("method").and_then(|m| m.as_str()) else {
                continue;
            };
            let Some(id) = msg.get("id") else {
                continue; // notification
            };
            let result = match method {
                "initialize" => serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "serverInfo": { "name": "scripted", "version": "0.0.0" },
                }),
                "tools/list" => serde_json::json!({ "tools": tools }),
                "tools/call" => serde_json::json!({
                    "content": [{
                        "type": "text",
                        "text": msg["params"]["arguments"].to_string(),
                    }],
                }),
                _ => serde_json::json!({}),
            };
            let reply = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result });
            let mut out = serde_json::to_string(&reply).unwrap();
            out.push('\n');
            if write.write_all(out.as_bytes()).await.is_err() {
                return;
            }
        }
    })
}

/// A ready downstream client wired to a scripted server.
pub(crate) async fn scripted_client(
    name: &str,
    tools: Vec<Value>,
) -> (Arc<DownstreamClient>, tokio::task::JoinHandle<()>) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let server = scripted_server(far, tools);
    let (read, write) = tokio::io::split(near);
    let client = sandbox_jsonrpc::Client::connect_io(read, write);
    let downstream =
        DownstreamClient::attach(ServerName::parse(name).unwrap(), client, None, Vec::new())
            .await
            .unwrap();
    (Arc::new(downstream), server)
}

pub(crate) fn echo_tool() -> Value {
    serde_json::json!({
        "name": "echo",
        "description": "Echo a message back",
        "inputSchema": { "type": "object", "properties": { "message": { "type": "string" } } },
    })
}
