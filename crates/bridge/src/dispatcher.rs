//! Routes framed requests from the sandbox to discovery or the client pool.
//!
//! One dispatcher per invocation. It owns the outbound frame writer (the
//! container's stdin); in-flight requests multiplex through a pending-id set
//! so concurrent `call_tool`s resolve in completion order, exactly one
//! response per id. When the invocation deadline fires the dispatcher stops
//! accepting work and fails everything pending with `sandbox_timeout`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::task::JoinSet;

use crate::discovery::{Detail, DiscoveryService};
use crate::error::{BridgeError, Result};
use crate::frame::{self, Frame, FrameError};
use crate::naming::ServerName;
use crate::pool::ClientPool;

pub struct Dispatcher {
    inner: Arc<Inner>,
    in_flight: tokio::sync::Mutex<JoinSet<()>>,
}

struct Inner {
    requested: Vec<ServerName>,
    pool: Arc<ClientPool>,
    discovery: Arc<DiscoveryService>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    deadline: tokio::time::Instant,
    timeout_seconds: u64,
    closed: AtomicBool,
    pending: Mutex<HashSet<u64>>,
}

impl Dispatcher {
    pub fn new<W>(
        requested: Vec<ServerName>,
        pool: Arc<ClientPool>,
        discovery: Arc<DiscoveryService>,
        writer: W,
        deadline: tokio::time::Instant,
        timeout_seconds: u64,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                requested,
                pool,
                discovery,
                writer: tokio::sync::Mutex::new(Box::new(writer)),
                deadline,
                timeout_seconds,
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashSet::new()),
            }),
            in_flight: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Enqueues one inbound `request` frame. Returns immediately; the
    /// response is written when the handler completes.
    pub async fn dispatch(&self, id: u64, method: String, params: Value) {
        let inner = self.inner.clone();
        if inner.closed.load(Ordering::Relaxed) || tokio::time::Instant::now() >= inner.deadline {
            let err = BridgeError::SandboxTimeout(inner.timeout_seconds);
            inner.write_frame(&Frame::response_err(id, &err)).await;
            return;
        }

        let is_duplicate = {
            let mut pending = lock_set(&inner.pending);
            !pending.insert(id)
        };
        if is_duplicate {
            let err = BridgeError::Protocol(format!("duplicate request id {id} from sandbox"));
            inner.write_frame(&Frame::response_err(id, &err)).await;
            return;
        }

        let mut in_flight = self.in_flight.lock().await;
        in_flight.spawn(async move {
            let outcome = inner.handle(&method, params).await;
            // Whoever removes the id from the pending set writes the one
            // response for it.
            let removed = lock_set(&inner.pending).remove(&id);
            if !removed {
                return;
            }
            let frame = match outcome {
                Ok(result) => Frame::response_ok(id, result),
                Err(Response::Bridge(err)) => Frame::response_err(id, &err),
                Err(Response::UnknownMethod(method)) => Frame::Response {
                    id,
                    ok: false,
                    result: None,
                    error: Some(FrameError {
                        code: "unknown_method".to_string(),
                        message: format!("unknown method: {method}"),
                    }),
                },
            };
            inner.write_frame(&frame).await;
        });
    }

    /// Deadline expiry: stop accepting, abort handlers, resolve everything
    /// still pending with `sandbox_timeout`.
    pub async fn fail_pending_with_timeout(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        let ids: Vec<u64> = {
            let mut pending = lock_set(&self.inner.pending);
            pending.drain().collect()
        };
        let err = BridgeError::SandboxTimeout(self.inner.timeout_seconds);
        for id in ids {
            self.inner.write_frame(&Frame::response_err(id, &err)).await;
        }
    }

    /// Normal completion: wait for in-flight handlers to finish writing.
    pub async fn drain(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        let mut in_flight = self.in_flight.lock().await;
        while in_flight.join_next().await.is_some() {}
    }
}

/// Handler outcome: either a table error or the dispatcher-level
/// `unknown_method` answer.
enum Response {
    Bridge(BridgeError),
    UnknownMethod(String),
}

impl From<BridgeError> for Response {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

impl Inner {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, Response> {
        match method {
            "call_tool" => self.call_tool(params).await.map_err(Response::from),
            "list_servers" => Ok(serde_json::json!({
                "servers": self.discovery.list_servers().await,
            })),
            "discovered_servers" => Ok(serde_json::json!({
                "servers": self.discovery.discovered_servers(),
            })),
            "list_tools" => {
                let server = required_server(&params)?;
                let tools = self
                    .discovery
                    .list_tools(&server)
                    .await
                    .map_err(Response::from)?;
                Ok(serde_json::json!({ "tools": tools }))
            }
            "query_tool_docs" => {
                let server = required_server(&params)?;
                let tool = optional_str(&params, "tool")?;
                let detail = Detail::parse(optional_str(&params, "detail")?.as_deref());
                let docs = self
                    .discovery
                    .query_tool_docs(&server, tool.as_deref(), detail)
                    .await
                    .map_err(Response::from)?;
                Ok(serde_json::json!({ "docs": docs }))
            }
            "search_tool_docs" => {
                let query = params
                    .get("query")
                    .and_then(|v| v.as_str())
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| {
                        Response::Bridge(BridgeError::InvalidRequest(
                            "missing 'query' value".to_string(),
                        ))
                    })?
                    .to_string();
                let limit = match params.get("limit") {
                    None | Some(Value::Null) => 5,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        Response::Bridge(BridgeError::InvalidRequest(
                            "'limit' must be an integer".to_string(),
                        ))
                    })?,
                };
                let detail = Detail::parse(optional_str(&params, "detail")?.as_deref());
                let results = self
                    .discovery
                    .search_tool_docs(&query, &self.requested, limit, detail)
                    .await
                    .map_err(Response::from)?;
                Ok(serde_json::json!({ "results": results }))
            }
            "describe_server" => {
                let server = required_server(&params)?;
                let described = self
                    .discovery
                    .describe_server(&server)
                    .await
                    .map_err(Response::from)?;
                Ok(described)
            }
            "capability_summary" => Ok(serde_json::json!({
                "summary": self.discovery.capability_summary(),
            })),
            other => Err(Response::UnknownMethod(other.to_string())),
        }
    }

    async fn call_tool(&self, params: Value) -> Result<Value> {
        let server = params
            .get("server")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BridgeError::InvalidRequest("missing 'server' value".to_string()))?;

        // Only servers in the invocation's requested set are addressable.
        let Some(server) = self
            .requested
            .iter()
            .find(|name| name.as_str() == server)
            .cloned()
        else {
            return Err(BridgeError::UnknownServer(server.to_string()));
        };

        let tool = params
            .get("tool")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BridgeError::InvalidRequest("missing 'tool' value".to_string()))?;
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(_) => {
                return Err(BridgeError::InvalidRequest(
                    "'arguments' must be an object".to_string(),
                ))
            }
        };

        // Per-call timeouts are clamped to the invocation's remaining budget;
        // with no explicit timeout the call inherits the deadline.
        let remaining = self
            .deadline
            .saturating_duration_since(tokio::time::Instant::now());
        let timeout = match params.get("timeout").and_then(|v| v.as_u64()) {
            Some(seconds) => remaining.min(Duration::from_secs(seconds)),
            None => remaining,
        };

        self.pool.call_tool(&server, tool, arguments, timeout).await
    }

    async fn write_frame(&self, frame: &Frame) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = frame::write_frame(&mut *writer, frame).await {
            tracing::debug!(%err, "failed to write response frame");
        }
    }
}

fn required_server(params: &Value) -> Result<ServerName, Response> {
    let raw = params
        .get("server")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Response::Bridge(BridgeError::InvalidRequest(
                "missing 'server' value".to_string(),
            ))
        })?;
    ServerName::parse(raw)
        .map_err(|_| Response::Bridge(BridgeError::UnknownServer(raw.to_string())))
}

fn optional_str(params: &Value, key: &str) -> Result<Option<String>, Response> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(Response::Bridge(BridgeError::InvalidRequest(format!(
            "'{key}' must be a string when provided"
        )))),
    }
}

fn lock_set(set: &Mutex<HashSet<u64>>) -> std::sync::MutexGuard<'_, HashSet<u64>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tokio::io::AsyncBufReadExt;

    use crate::testutil::{self, echo_tool};

    struct Fixture {
        dispatcher: Dispatcher,
        responses: tokio::io::BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        _tasks: Vec<tokio::task::JoinHandle<()>>,
    }

    async fn fixture(requested: &[&str], deadline_in: Duration) -> Fixture {
        let catalog = testutil::catalog(&["stub", "other"]);
        let pool = Arc::new(ClientPool::new(catalog.clone()));
        let (client, task) = testutil::scripted_client("stub", vec![echo_tool()]).await;
        pool.insert_ready(client).await;
        let discovery = Arc::new(DiscoveryService::new(catalog, pool.clone()));

        let (host_side, observer) = tokio::io::duplex(256 * 1024);
        let (_unused_read, writer) = tokio::io::split(host_side);
        let (observer_read, _observer_write) = tokio::io::split(observer);

        let requested = requested
            .iter()
            .map(|name| ServerName::parse(name).unwrap())
            .collect();
        let dispatcher = Dispatcher::new(
            requested,
            pool,
            discovery,
            writer,
            tokio::time::Instant::now() + deadline_in,
            deadline_in.as_secs().max(1),
        );
        Fixture {
            dispatcher,
            responses: tokio::io::BufReader::new(observer_read),
            _tasks: vec![task],
        }
    }

    impl Fixture {
        async fn next_response(&mut self) -> Frame {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(2), self.responses.read_line(&mut line))
                .await
                .expect("response in time")
                .expect("read ok");
            frame::decode(line.trim_end().as_bytes()).expect("valid frame")
        }
    }

    #[tokio::test]
    async fn call_tool_to_requested_server_succeeds() {
        let mut fx = fixture(&["stub"], Duration::from_secs(5)).await;
        fx.dispatcher
            .dispatch(
                1,
                "call_tool".into(),
                serde_json::json!({
                    "server": "stub",
                    "tool": "echo",
                    "arguments": { "message": "hi" },
                }),
            )
            .await;

        let Frame::Response {
            id, ok, result, ..
        } = fx.next_response().await
        else {
            panic!("expected response frame");
        };
        assert_eq!(id, 1);
        assert!(ok);
        let text = result.unwrap()["content"][0]["text"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(text.contains("hi"));
    }

    #[tokio::test]
    async fn unrequested_server_is_unknown_even_when_known() {
        // "other" exists in the catalog but is not in the requested set.
        let mut fx = fixture(&["stub"], Duration::from_secs(5)).await;
        fx.dispatcher
            .dispatch(
                7,
                "call_tool".into(),
                serde_json::json!({ "server": "other", "tool": "echo" }),
            )
            .await;

        let Frame::Response { id, ok, error, .. } = fx.next_response().await else {
            panic!("expected response frame");
        };
        assert_eq!(id, 7);
        assert!(!ok);
        assert_eq!(error.unwrap().code, "unknown_server");
    }

    #[tokio::test]
    async fn unknown_methods_get_a_distinct_code() {
        let mut fx = fixture(&["stub"], Duration::from_secs(5)).await;
        fx.dispatcher
            .dispatch(2, "transmogrify".into(), Value::Null)
            .await;

        let Frame::Response { ok, error, .. } = fx.next_response().await else {
            panic!("expected response frame");
        };
        assert!(!ok);
        assert_eq!(error.unwrap().code, "unknown_method");
    }

    #[tokio::test]
    async fn discovery_methods_answer_without_requested_membership() {
        let mut fx = fixture(&["stub"], Duration::from_secs(5)).await;

        fx.dispatcher
            .dispatch(3, "discovered_servers".into(), Value::Null)
            .await;
        let Frame::Response { ok, result, .. } = fx.next_response().await else {
            panic!("expected response frame");
        };
        assert!(ok);
        assert_eq!(
            result.unwrap()["servers"],
            serde_json::json!(["other", "stub"])
        );

        fx.dispatcher
            .dispatch(
                4,
                "query_tool_docs".into(),
                serde_json::json!({ "server": "stub", "tool": "echo", "detail": "full" }),
            )
            .await;
        let Frame::Response { ok, result, .. } = fx.next_response().await else {
            panic!("expected response frame");
        };
        assert!(ok);
        let docs = result.unwrap()["docs"].clone();
        assert_eq!(docs[0]["toolAlias"], "echo");
        assert!(docs[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn concurrent_calls_all_resolve_with_unique_ids() {
        let mut fx = fixture(&["stub"], Duration::from_secs(10)).await;
        const CALLS: u64 = 50;
        for id in 0..CALLS {
            fx.dispatcher
                .dispatch(
                    id,
                    "call_tool".into(),
                    serde_json::json!({
                        "server": "stub",
                        "tool": "echo",
                        "arguments": { "n": id },
                    }),
                )
                .await;
        }

        let mut seen = HashMap::new();
        for _ in 0..CALLS {
            let Frame::Response { id, ok, .. } = fx.next_response().await else {
                panic!("expected response frame");
            };
            assert!(ok);
            *seen.entry(id).or_insert(0u32) += 1;
        }
        assert_eq!(seen.len() as u64, CALLS, "every id answered");
        assert!(seen.values().all(|count| *count == 1), "no id answered twice");
    }

    #[tokio::test]
    async fn after_deadline_requests_fail_with_sandbox_timeout() {
        let mut fx = fixture(&["stub"], Duration::from_secs(5)).await;
        fx.dispatcher.fail_pending_with_timeout().await;

        fx.dispatcher
            .dispatch(
                9,
                "call_tool".into(),
                serde_json::json!({ "server": "stub", "tool": "echo" }),
            )
            .await;
        let Frame::Response { id, ok, error, .. } = fx.next_response().await else {
            panic!("expected response frame");
        };
        assert_eq!(id, 9);
        assert!(!ok);
        assert_eq!(error.unwrap().code, "sandbox_timeout");
    }

    #[tokio::test]
    async fn malformed_call_params_are_invalid_request() {
        let mut fx = fixture(&["stub"], Duration::from_secs(5)).await;
        fx.dispatcher
            .dispatch(
                11,
                "call_tool".into(),
                serde_json::json!({ "server": "stub", "tool": "echo", "arguments": [1, 2] }),
            )
            .await;
        let Frame::Response { ok, error, .. } = fx.next_response().await else {
            panic!("expected response frame");
        };
        assert!(!ok);
        assert_eq!(error.unwrap().code, "invalid_request");
    }
}
