#![forbid(unsafe_code)]

//! `sandbox-jsonrpc` is a small JSON-RPC 2.0 client for MCP servers spoken to
//! over newline-delimited stdio.
//!
//! Transports:
//! - stdio (spawned child process)
//! - any `AsyncRead + AsyncWrite` pair (used by tests with in-memory pipes)
//!
//! Design goals:
//! - Minimal dependencies and low ceremony (`serde_json::Value` based)
//! - Support notifications and server->client requests
//! - Bounded queues + per-message size limits to reduce DoS risk
//!
//! Non-goals:
//! - Implementing a JSON-RPC server
//! - Automatic reconnect (the caller owns restart policy)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum bytes for a single JSON-RPC message (one line).
    pub max_message_bytes: usize,
    /// Maximum buffered notifications from the server.
    pub notifications_capacity: usize,
    /// Maximum buffered server->client requests.
    pub requests_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // Large enough for typical MCP messages, but bounded.
            max_message_bytes: 16 * 1024 * 1024,
            notifications_capacity: 256,
            requests_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub limits: Limits,
    /// When true (default), kill the child process if the `Client` is dropped.
    ///
    /// Best-effort: it does not guarantee the child is reaped. Prefer an
    /// explicit `Client::wait_with_timeout` call when you own the child
    /// lifecycle.
    pub kill_on_drop: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            kill_on_drop: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolErrorKind {
    /// The client/transport was closed (explicitly or via drop).
    Closed,
    /// Waiting for a child process to exit timed out.
    WaitTimeout,
    /// The peer sent an invalid JSON / JSON-RPC message.
    InvalidMessage,
    /// Catch-all for internal invariants.
    Other,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for ProtocolError {}

impl Error {
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError {
            kind,
            message: message.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Protocol(err) if err.kind == ProtocolErrorKind::Closed)
    }

    /// Returns true if this error came from a bounded wait that expired.
    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, Error::Protocol(err) if err.kind == ProtocolErrorKind::WaitTimeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    String(String),
    Integer(i64),
}

type PendingRequests = Arc<Mutex<HashMap<Id, oneshot::Sender<Result<Value, Error>>>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub invalid_json_lines: u64,
    pub dropped_notifications: u64,
}

#[derive(Debug, Default)]
struct ClientStatsInner {
    invalid_json_lines: AtomicU64,
    dropped_notifications: AtomicU64,
}

impl ClientStatsInner {
    fn snapshot(&self) -> ClientStats {
        ClientStats {
            invalid_json_lines: self.invalid_json_lines.load(Ordering::Relaxed),
            dropped_notifications: self.dropped_notifications.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable sending half of a client.
///
/// All clones share one write lock, one id counter and one pending map, so
/// concurrent requests from different tasks multiplex over the same pipe.
#[derive(Clone)]
pub struct ClientHandle {
    write: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    next_id: Arc<AtomicI64>,
    pending: PendingRequests,
    stats: Arc<ClientStatsInner>,
    closed: Arc<AtomicBool>,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub fn stats(&self) -> ClientStats {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    fn check_closed(&self) -> Result<(), Error> {
        if !self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "client closed".to_string());
        Err(Error::protocol(ProtocolErrorKind::Closed, reason))
    }

    async fn close_with_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.close_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason.clone());
            }
        }

        drain_pending(
            &self.pending,
            &Error::protocol(ProtocolErrorKind::Closed, reason),
        );
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
        // Many `AsyncWrite` impls (e.g. `tokio::process::ChildStdin`) only
        // fully close on drop; replacing the writer guarantees the write end
        // is closed.
        let _ = std::mem::replace(&mut *write, Box::new(tokio::io::sink()));
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.check_closed()?;
        let mut msg = Map::new();
        msg.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        msg.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params.filter(|v| !v.is_null()) {
            msg.insert("params".to_string(), params);
        }

        let mut line = serde_json::to_string(&Value::Object(msg))?;
        line.push('\n');
        self.write_line(&line).await
    }

    /// Sends a request and awaits the matching response.
    ///
    /// Cancellation-safe: dropping the returned future removes the pending
    /// entry, so a late response is discarded rather than leaked.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.check_closed()?;
        let id = Id::Integer(self.next_id.fetch_add(1, Ordering::Relaxed));

        let (tx, rx) = oneshot::channel::<Result<Value, Error>>();
        {
            let mut pending = lock_pending(&self.pending);
            pending.insert(id.clone(), tx);
        }
        let mut guard = PendingRequestGuard::new(self.pending.clone(), id.clone());

        let mut req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params.filter(|v| !v.is_null()) {
            req["params"] = params;
        }

        let mut line = serde_json::to_string(&req)?;
        line.push('\n');
        self.write_line(&line).await?;

        match rx.await {
            Ok(result) => {
                guard.disarm();
                result
            }
            Err(_) => Err(Error::protocol(
                ProtocolErrorKind::Closed,
                "response channel closed",
            )),
        }
    }

    /// `request` bounded by `timeout`.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        match tokio::time::timeout(timeout, self.request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(Error::protocol(
                ProtocolErrorKind::WaitTimeout,
                format!("request timed out after {timeout:?}: {method}"),
            )),
        }
    }

    pub async fn respond_ok(&self, id: Id, result: Value) -> Result<(), Error> {
        self.check_closed()?;
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        self.write_line(&line).await
    }

    pub async fn respond_error(
        &self,
        id: Id,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), Error> {
        self.check_closed()?;
        let mut error = serde_json::json!({
            "code": code,
            "message": message.into(),
        });
        if let Some(data) = data {
            error["data"] = data;
        }
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": error,
        });
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), Error> {
        self.check_closed()?;
        let mut write = self.write.lock().await;
        write.write_all(line.as_bytes()).await?;
        write.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: Id,
    pub method: String,
    pub params: Option<Value>,
    responder: ClientHandle,
}

impl IncomingRequest {
    pub async fn respond_ok(&self, result: Value) -> Result<(), Error> {
        self.responder.respond_ok(self.id.clone(), result).await
    }

    pub async fn respond_error(
        &self,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), Error> {
        self.responder
            .respond_error(self.id.clone(), code, message, data)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOnTimeout {
    /// Return an error if the child does not exit within the timeout.
    ///
    /// The child is left running; use `Client::take_child` to manage it.
    ReturnError,
    /// Kill the child if it does not exit within the timeout, then wait up to
    /// `kill_timeout` for it to exit.
    Kill { kill_timeout: Duration },
}

#[derive(Debug)]
pub struct Client {
    handle: ClientHandle,
    child: Option<Child>,
    notifications_rx: Option<mpsc::Receiver<Notification>>,
    requests_rx: Option<mpsc::Receiver<IncomingRequest>>,
    task: tokio::task::JoinHandle<()>,
}

impl Client {
    pub async fn spawn_command(cmd: Command) -> Result<Self, Error> {
        Self::spawn_command_with_options(cmd, SpawnOptions::default()).await
    }

    pub async fn spawn_command_with_options(
        mut cmd: Command,
        options: SpawnOptions,
    ) -> Result<Self, Error> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.kill_on_drop(options.kill_on_drop);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::protocol(ProtocolErrorKind::Other, "child stdin not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::protocol(ProtocolErrorKind::Other, "child stdout not captured")
        })?;

        Ok(Self::create(stdout, stdin, Some(child), options))
    }

    pub fn connect_io<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_io_with_options(read, write, SpawnOptions::default())
    }

    pub fn connect_io_with_options<R, W>(read: R, write: W, options: SpawnOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::create(read, write, None, options)
    }

    fn create<R, W>(read: R, write: W, child: Option<Child>, options: SpawnOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let limits = options.limits;
        let (notify_tx, notify_rx) = mpsc::channel(limits.notifications_capacity.max(1));
        let (request_tx, request_rx) = mpsc::channel(limits.requests_capacity.max(1));
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(ClientStatsInner::default());
        let handle = ClientHandle {
            write: Arc::new(tokio::sync::Mutex::new(Box::new(write) as _)),
            next_id: Arc::new(AtomicI64::new(1)),
            pending: pending.clone(),
            stats: stats.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            close_reason: Arc::new(Mutex::new(None)),
        };

        let task = spawn_reader_task(
            read,
            ReaderTaskContext {
                pending,
                stats,
                notify_tx,
                request_tx,
                responder: handle.clone(),
                max_message_bytes: limits.max_message_bytes.max(1),
            },
        );

        Self {
            handle,
            child,
            notifications_rx: Some(notify_rx),
            requests_rx: Some(request_rx),
            task,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.handle.stats()
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications_rx.take()
    }

    /// Takes the server->client request stream.
    pub fn take_requests(&mut self) -> Option<mpsc::Receiver<IncomingRequest>> {
        self.requests_rx.take()
    }

    /// Declares that this client never services server->client requests.
    ///
    /// Dropping the receiver makes the reader answer every server request
    /// with `-32601 method not found` instead of buffering it.
    pub fn reject_server_requests(&mut self) {
        self.requests_rx = None;
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.handle.notify(method, params).await
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.handle.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.handle
            .request_with_timeout(method, params, timeout)
            .await
    }

    /// Closes the client and waits for the underlying child process to exit,
    /// up to `timeout`. Clients created without a child return `Ok(None)`.
    pub async fn wait_with_timeout(
        &mut self,
        timeout: Duration,
        on_timeout: WaitOnTimeout,
    ) -> Result<Option<std::process::ExitStatus>, Error> {
        self.task.abort();
        self.handle.close_with_reason("client closed").await;

        let Some(child) = &mut self.child else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => match on_timeout {
                WaitOnTimeout::ReturnError => Err(Error::protocol(
                    ProtocolErrorKind::WaitTimeout,
                    format!("wait timed out after {timeout:?}"),
                )),
                WaitOnTimeout::Kill { kill_timeout } => {
                    let child_id = child.id();
                    if let Err(err) = child.start_kill() {
                        match child.try_wait() {
                            Ok(Some(status)) => return Ok(Some(status)),
                            Ok(None) => {
                                return Err(Error::protocol(
                                    ProtocolErrorKind::WaitTimeout,
                                    format!(
                                        "wait timed out after {timeout:?}; failed to kill child (id={child_id:?}): {err}"
                                    ),
                                ));
                            }
                            Err(try_wait_err) => {
                                return Err(Error::protocol(
                                    ProtocolErrorKind::WaitTimeout,
                                    format!(
                                        "wait timed out after {timeout:?}; failed to kill child (id={child_id:?}): {err}; try_wait failed: {try_wait_err}"
                                    ),
                                ));
                            }
                        }
                    }

                    match tokio::time::timeout(kill_timeout, child.wait()).await {
                        Ok(status) => Ok(Some(status?)),
                        Err(_) => Err(Error::protocol(
                            ProtocolErrorKind::WaitTimeout,
                            format!(
                                "wait timed out after {timeout:?}; killed child (id={child_id:?}) but it did not exit within {kill_timeout:?}"
                            ),
                        )),
                    }
                }
            },
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.handle.close_reason.lock() {
            if guard.is_none() {
                *guard = Some("client closed".to_string());
            }
        }
        self.task.abort();
        drain_pending(
            &self.handle.pending,
            &Error::protocol(ProtocolErrorKind::Closed, "client closed"),
        );
    }
}

struct PendingRequestGuard {
    pending: PendingRequests,
    id: Id,
    armed: bool,
}

impl PendingRequestGuard {
    fn new(pending: PendingRequests, id: Id) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequestGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut pending = lock_pending(&self.pending);
        pending.remove(&self.id);
    }
}

struct ReaderTaskContext {
    pending: PendingRequests,
    stats: Arc<ClientStatsInner>,
    notify_tx: mpsc::Sender<Notification>,
    request_tx: mpsc::Sender<IncomingRequest>,
    responder: ClientHandle,
    max_message_bytes: usize,
}

fn spawn_reader_task<R>(reader: R, ctx: ReaderTaskContext) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let ReaderTaskContext {
            pending,
            stats,
            notify_tx,
            request_tx,
            responder,
            max_message_bytes,
        } = ctx;

        let mut reader = tokio::io::BufReader::new(reader);
        loop {
            match read_line_limited(&mut reader, max_message_bytes).await {
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let value: Value = match serde_json::from_slice(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            // A peer that stops speaking clean newline JSON
                            // is broken; fail the connection so the owner can
                            // restart it.
                            stats.invalid_json_lines.fetch_add(1, Ordering::Relaxed);
                            responder
                                .close_with_reason(format!("invalid json from server: {err}"))
                                .await;
                            return;
                        }
                    };
                    handle_incoming_value(
                        value,
                        &pending,
                        &stats,
                        &notify_tx,
                        &request_tx,
                        &responder,
                    )
                    .await;
                }
                Ok(None) => {
                    responder
                        .close_with_reason("server closed connection")
                        .await;
                    return;
                }
                Err(err) => {
                    responder.close_with_reason(format!("io error: {err}")).await;
                    return;
                }
            }
        }
    })
}

async fn handle_incoming_value(
    value: Value,
    pending: &PendingRequests,
    stats: &Arc<ClientStatsInner>,
    notify_tx: &mpsc::Sender<Notification>,
    request_tx: &mpsc::Sender<IncomingRequest>,
    responder: &ClientHandle,
) {
    const METHOD_NOT_FOUND: i64 = -32601;
    const CLIENT_OVERLOADED: i64 = -32000;

    let Value::Object(map) = value else {
        stats.invalid_json_lines.fetch_add(1, Ordering::Relaxed);
        return;
    };

    if map.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        stats.invalid_json_lines.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let method = map.get("method").and_then(|v| v.as_str());
    if let Some(method) = method {
        let params = map.get("params").cloned();
        if let Some(id_value) = map.get("id") {
            let Some(id) = parse_id(id_value) else {
                stats.invalid_json_lines.fetch_add(1, Ordering::Relaxed);
                return;
            };

            let request = IncomingRequest {
                id: id.clone(),
                method: method.to_string(),
                params,
                responder: responder.clone(),
            };
            match request_tx.try_send(request) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let _ = responder
                        .respond_error(id, CLIENT_OVERLOADED, "client overloaded", None)
                        .await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let _ = responder
                        .respond_error(
                            id,
                            METHOD_NOT_FOUND,
                            format!("method not found: {method}"),
                            None,
                        )
                        .await;
                }
            }
            return;
        }

        if notify_tx
            .try_send(Notification {
                method: method.to_string(),
                params,
            })
            .is_err()
        {
            stats.dropped_notifications.fetch_add(1, Ordering::Relaxed);
        }
        return;
    }

    handle_response(pending, map);
}

fn handle_response(pending: &PendingRequests, map: Map<String, Value>) {
    let Some(id) = map.get("id").and_then(parse_id) else {
        return;
    };

    let tx = {
        let mut pending = lock_pending(pending);
        pending.remove(&id)
    };
    let Some(tx) = tx else {
        return;
    };

    let has_error = map.contains_key("error");
    let has_result = map.contains_key("result");
    let outcome = match (has_error, has_result) {
        (true, false) => match map.get("error") {
            Some(Value::Object(error)) => {
                let code = error.get("code").and_then(|v| v.as_i64());
                let message = error.get("message").and_then(|v| v.as_str());
                match (code, message) {
                    (Some(code), Some(message)) => Err(Error::Rpc {
                        code,
                        message: message.to_string(),
                        data: error.get("data").cloned(),
                    }),
                    _ => Err(Error::protocol(
                        ProtocolErrorKind::InvalidMessage,
                        "invalid error response",
                    )),
                }
            }
            _ => Err(Error::protocol(
                ProtocolErrorKind::InvalidMessage,
                "invalid error response",
            )),
        },
        (false, true) => Ok(map.get("result").cloned().unwrap_or(Value::Null)),
        _ => Err(Error::protocol(
            ProtocolErrorKind::InvalidMessage,
            "invalid response: must include exactly one of result/error",
        )),
    };

    let _ = tx.send(outcome);
}

/// Reads one `\n`-terminated line, failing if it exceeds `max_bytes`.
pub async fn read_line_limited<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, std::io::Error> {
    use tokio::io::AsyncBufReadExt;

    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|b| *b == b'\n');
        let take = newline_pos
            .map(|idx| idx.saturating_add(1))
            .unwrap_or(available.len());
        if buf.len().saturating_add(take) > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "jsonrpc message too large",
            ));
        }
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline_pos.is_some() {
            break;
        }
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }

    Ok(Some(buf))
}

fn lock_pending(
    pending: &PendingRequests,
) -> std::sync::MutexGuard<'_, HashMap<Id, oneshot::Sender<Result<Value, Error>>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn drain_pending(pending: &PendingRequests, err: &Error) {
    let pending = {
        let mut pending = lock_pending(pending);
        std::mem::take(&mut *pending)
    };

    for (_id, tx) in pending {
        let _ = tx.send(Err(clone_error_for_drain(err)));
    }
}

fn clone_error_for_drain(err: &Error) -> Error {
    match err {
        Error::Io(err) => Error::Io(std::io::Error::new(err.kind(), err.to_string())),
        Error::Json(err) => Error::protocol(ProtocolErrorKind::Other, format!("json error: {err}")),
        Error::Rpc {
            code,
            message,
            data,
        } => Error::Rpc {
            code: *code,
            message: message.clone(),
            data: data.clone(),
        },
        Error::Protocol(err) => Error::Protocol(err.clone()),
    }
}

fn parse_id(value: &Value) -> Option<Id> {
    match value {
        Value::String(value) => Some(Id::String(value.clone())),
        Value::Number(value) => value.as_i64().map(Id::Integer).or_else(|| {
            value
                .as_u64()
                .and_then(|v| i64::try_from(v).ok())
                .map(Id::Integer)
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_limited_rejects_oversized_lines() {
        let data = vec![b'a'; 64];
        let mut reader = tokio::io::BufReader::new(&data[..]);
        let err = read_line_limited(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_line_limited_strips_crlf() {
        let data = b"{\"x\":1}\r\nrest".to_vec();
        let mut reader = tokio::io::BufReader::new(&data[..]);
        let line = read_line_limited(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(line, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn invalid_json_closes_the_client() {
        use tokio::io::AsyncWriteExt;

        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (_server_read, mut server_write) = tokio::io::split(server_stream);

        let client = Client::connect_io(client_read, client_write);
        let handle = client.handle();

        server_write.write_all(b"not-json\n").await.unwrap();
        server_write.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.stats().invalid_json_lines, 1);
        assert!(handle
            .close_reason()
            .unwrap()
            .contains("invalid json from server"));
    }
}
