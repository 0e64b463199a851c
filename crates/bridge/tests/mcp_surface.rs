use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use mcp_sandbox_bridge::{
    serve_io, Bridge, Catalog, Frame, RunOutcome, RunStatus, Settings,
};

fn empty_bridge() -> Arc<Bridge> {
    Arc::new(Bridge::with_catalog(
        Settings::default(),
        Arc::new(Catalog::default()),
    ))
}

async fn rpc(
    requests: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>,
    responses: &mut tokio::io::BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    message: Value,
) -> Value {
    let mut line = serde_json::to_string(&message).unwrap();
    line.push('\n');
    requests.write_all(line.as_bytes()).await.unwrap();
    requests.flush().await.unwrap();

    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(2), responses.read_line(&mut reply))
        .await
        .expect("reply in time")
        .expect("read ok");
    serde_json::from_str(&reply).expect("valid json")
}

#[tokio::test]
async fn a_full_session_without_a_container_runtime() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (client_read, mut client_write) = tokio::io::split(client_side);
    let (server_read, server_write) = tokio::io::split(server_side);
    let _server = tokio::spawn(serve_io(empty_bridge(), server_read, server_write));
    let mut responses = tokio::io::BufReader::new(client_read);

    let init = rpc(
        &mut client_write,
        &mut responses,
        serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": { "protocolVersion": "2025-06-18", "capabilities": {} },
        }),
    )
    .await;
    assert_eq!(init["result"]["serverInfo"]["name"], "mcp-sandbox-bridge");

    let tools = rpc(
        &mut client_write,
        &mut responses,
        serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    let tools = tools["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "run_python");
    assert_eq!(tools[0]["inputSchema"]["required"], serde_json::json!(["code"]));

    // Asking for an unconfigured server fails inside the result envelope,
    // before any container is spawned.
    let call = rpc(
        &mut client_write,
        &mut responses,
        serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {
                "name": "run_python",
                "arguments": { "code": "await mcp_x.y()", "servers": ["x"] },
            },
        }),
    )
    .await;
    assert_eq!(call["result"]["isError"], true);
    assert_eq!(call["result"]["structuredContent"]["status"], "error");
    let stderr = call["result"]["structuredContent"]["stderr"].as_str().unwrap();
    assert!(stderr.contains("unknown_server"), "{stderr}");
}

#[test]
fn frame_grammar_round_trips_through_the_public_api() {
    let frames = vec![
        serde_json::json!({ "kind": "request", "id": 1, "method": "call_tool",
            "params": { "server": "stub", "tool": "echo", "arguments": {} } }),
        serde_json::json!({ "kind": "response", "id": 1, "ok": true, "result": { "x": 1 } }),
        serde_json::json!({ "kind": "response", "id": 2, "ok": false,
            "error": { "code": "unknown_server", "message": "unknown server: x" } }),
        serde_json::json!({ "kind": "stdout", "data": "2\n" }),
        serde_json::json!({ "kind": "stderr", "data": "boom" }),
        serde_json::json!({ "kind": "done", "status": "ok" }),
        serde_json::json!({ "kind": "done", "status": "error", "error": "boom" }),
    ];
    for raw in frames {
        let line = serde_json::to_string(&raw).unwrap();
        let frame: Frame = serde_json::from_str(&line).expect("recognized kind");
        let reencoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(reencoded, raw);
    }
}

#[test]
fn structured_content_decodes_back_to_the_outcome() {
    let outcome = RunOutcome {
        status: RunStatus::Timeout,
        stdout: "partial".to_string(),
        stderr: String::new(),
        error: Some("sandbox_timeout: execution timed out after 1s".to_string()),
        servers: vec!["stub".to_string()],
    };
    let rendered = mcp_sandbox_bridge::render(&outcome, mcp_sandbox_bridge::OutputMode::Compact);
    assert!(rendered.is_error);

    let decoded: RunOutcome = serde_json::from_value(rendered.structured).unwrap();
    assert_eq!(decoded, outcome);
}
