use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).expect("valid json")
}

#[tokio::test]
async fn request_is_correlated_by_id() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let handle = client.handle();

    let server = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(server_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let req = parse_line(&line);
        assert_eq!(req["method"], "demo/echo");
        let id = req["id"].clone();
        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "echo": req["params"]["value"] },
        });
        let mut out = serde_json::to_string(&reply).unwrap();
        out.push('\n');
        server_write.write_all(out.as_bytes()).await.unwrap();
        server_write.flush().await.unwrap();
    });

    let result = handle
        .request("demo/echo", Some(serde_json::json!({ "value": 7 })))
        .await
        .unwrap();
    assert_eq!(result["echo"], 7);
    server.await.unwrap();
}

#[tokio::test]
async fn responses_resolve_out_of_order() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let handle = client.handle();

    let server = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(server_read).lines();
        let first = parse_line(&lines.next_line().await.unwrap().unwrap());
        let second = parse_line(&lines.next_line().await.unwrap().unwrap());
        // Answer in reverse submission order.
        for req in [second, first] {
            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": req["params"]["tag"],
            });
            let mut out = serde_json::to_string(&reply).unwrap();
            out.push('\n');
            server_write.write_all(out.as_bytes()).await.unwrap();
        }
        server_write.flush().await.unwrap();
    });

    let h1 = handle.clone();
    let h2 = handle.clone();
    let (a, b) = tokio::join!(
        h1.request("demo/tagged", Some(serde_json::json!({ "tag": "a" }))),
        h2.request("demo/tagged", Some(serde_json::json!({ "tag": "b" }))),
    );
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    server.await.unwrap();
}

#[tokio::test]
async fn rpc_error_response_surfaces_code_and_message() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let handle = client.handle();

    let server = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(server_read).lines();
        let req = parse_line(&lines.next_line().await.unwrap().unwrap());
        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": { "code": -32601, "message": "method not found" },
        });
        let mut out = serde_json::to_string(&reply).unwrap();
        out.push('\n');
        server_write.write_all(out.as_bytes()).await.unwrap();
        server_write.flush().await.unwrap();
    });

    let err = handle.request("demo/missing", None).await.unwrap_err();
    match err {
        sandbox_jsonrpc::Error::Rpc { code, message, .. } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "method not found");
        }
        other => panic!("unexpected error: {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn rejected_server_requests_get_method_not_found() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, mut server_write) = tokio::io::split(server_stream);

    let mut client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    client.reject_server_requests();

    let incoming = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 99,
        "method": "sampling/createMessage",
    });
    let mut out = serde_json::to_string(&incoming).unwrap();
    out.push('\n');
    server_write.write_all(out.as_bytes()).await.unwrap();
    server_write.flush().await.unwrap();

    let mut lines = tokio::io::BufReader::new(server_read).lines();
    let reply = parse_line(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(reply["id"], 99);
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn notifications_are_delivered_in_order() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (_server_read, mut server_write) = tokio::io::split(server_stream);

    let mut client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let mut notifications = client.take_notifications().unwrap();

    for idx in 0..3 {
        let note = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": { "idx": idx },
        });
        let mut out = serde_json::to_string(&note).unwrap();
        out.push('\n');
        server_write.write_all(out.as_bytes()).await.unwrap();
    }
    server_write.flush().await.unwrap();

    for idx in 0..3 {
        let note = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.method, "notifications/progress");
        assert_eq!(note.params.unwrap()["idx"], idx);
    }
}

#[tokio::test]
async fn peer_eof_fails_pending_requests() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let handle = client.handle();

    let pending = tokio::spawn(async move { handle.request("demo/never", None).await });
    tokio::task::yield_now().await;
    drop(server_stream);

    let err = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_closed(), "unexpected error: {err}");
}

#[tokio::test]
async fn drop_closes_write_end() {
    let (client_stream, server_stream) = tokio::io::duplex(64);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (mut server_read, _server_write) = tokio::io::split(server_stream);

    let client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let handle = client.handle();
    drop(client);

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(1), server_read.read(&mut buf))
        .await
        .expect("server read completed")
        .expect("server read ok");
    assert_eq!(n, 0, "peer should observe EOF after client drop");

    let err = handle
        .notify("demo/notify", None)
        .await
        .expect_err("handle should be closed after client drop");
    assert!(err.is_closed());
}

#[tokio::test]
async fn wait_with_timeout_returns_none_without_child() {
    let (client_stream, _server_stream) = tokio::io::duplex(64);
    let (client_read, client_write) = tokio::io::split(client_stream);

    let mut client = sandbox_jsonrpc::Client::connect_io(client_read, client_write);
    let status = client
        .wait_with_timeout(
            Duration::from_millis(1),
            sandbox_jsonrpc::WaitOnTimeout::ReturnError,
        )
        .await
        .expect("wait ok");
    assert!(status.is_none());
}
