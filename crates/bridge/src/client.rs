//! One persistent stdio session to one downstream MCP server.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};

use crate::config::ServerRecord;
use crate::error::{BridgeError, Result};
use crate::naming::ServerName;

/// MCP protocol version offered during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Budget for the initialize handshake and the initial tools/list fetch.
const START_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for a cache refresh triggered by `tools/list_changed`.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a killed child gets to actually exit.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle states, as observed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Cold,
    Starting,
    Ready,
    Failed,
    Closing,
}

#[derive(Debug)]
pub struct DownstreamClient {
    name: ServerName,
    handle: sandbox_jsonrpc::ClientHandle,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    tools: tokio::sync::Mutex<Vec<Value>>,
    tools_stale: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

#[derive(Debug)]
struct Lifecycle {
    client: sandbox_jsonrpc::Client,
    child: Option<Child>,
}

impl DownstreamClient {
    /// Spawns the server process, performs the MCP handshake and caches the
    /// advertised tool list.
    pub async fn start(record: &ServerRecord) -> Result<Self> {
        let mut cmd = Command::new(&record.command);
        cmd.args(&record.args);
        for (key, value) in &record.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &record.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            BridgeError::DownstreamUnavailable(format!(
                "failed to spawn {} ({}): {err}",
                record.name, record.command
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::DownstreamUnavailable("child stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::DownstreamUnavailable("child stdout not captured".to_string())
        })?;

        let mut tasks = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            let server = record.name.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(server = %server, line, "downstream stderr");
                }
            }));
        }

        let client = sandbox_jsonrpc::Client::connect_io(stdout, stdin);
        Self::attach(record.name.clone(), client, Some(child), tasks).await
    }

    /// Wires an already-connected transport up as a downstream session and
    /// performs the MCP handshake. `start` builds on this; tests attach
    /// in-memory pipes directly.
    pub(crate) async fn attach(
        name: ServerName,
        mut client: sandbox_jsonrpc::Client,
        child: Option<Child>,
        mut tasks: Vec<tokio::task::JoinHandle<()>>,
    ) -> Result<Self> {
        client.reject_server_requests();
        let handle = client.handle();
        let tools_stale = Arc::new(AtomicBool::new(false));

        if let Some(mut notifications) = client.take_notifications() {
            let server = name.clone();
            let stale = tools_stale.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(note) = notifications.recv().await {
                    if note.method == "notifications/tools/list_changed" {
                        tracing::debug!(server = %server, "tool list changed");
                        stale.store(true, Ordering::Relaxed);
                    }
                }
            }));
        }

        let this = Self {
            name,
            handle,
            lifecycle: tokio::sync::Mutex::new(Lifecycle { client, child }),
            tools: tokio::sync::Mutex::new(Vec::new()),
            tools_stale,
            tasks,
        };
        this.handshake().await?;
        Ok(this)
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "clientInfo": {
                "name": "mcp-sandbox-bridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });
        let init = self
            .handle
            .request_with_timeout("initialize", Some(params), START_TIMEOUT)
            .await
            .map_err(|err| {
                BridgeError::DownstreamUnavailable(format!(
                    "initialize failed (server={}): {err}",
                    self.name
                ))
            })?;
        if let Some(version) = init.get("protocolVersion").and_then(|v| v.as_str()) {
            if version != MCP_PROTOCOL_VERSION {
                tracing::debug!(server = %self.name, version, "protocol version mismatch");
            }
        }
        self.handle
            .notify("notifications/initialized", None)
            .await
            .map_err(|err| {
                BridgeError::DownstreamUnavailable(format!(
                    "initialized notification failed (server={}): {err}",
                    self.name
                ))
            })?;

        let tools = self.fetch_tools().await?;
        *self.tools.lock().await = tools;
        Ok(())
    }

    async fn fetch_tools(&self) -> Result<Vec<Value>> {
        let result = self
            .handle
            .request_with_timeout("tools/list", None, REFRESH_TIMEOUT)
            .await
            .map_err(BridgeError::from)?;
        Ok(result
            .get("tools")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    /// Whether the downstream announced a tool-list change that has not been
    /// folded into the cache yet.
    pub fn tools_stale(&self) -> bool {
        self.tools_stale.load(Ordering::Relaxed)
    }

    /// The reader task observes EOF when the child exits, which closes the
    /// shared handle; liveness follows from that.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Cached tool list, refreshed when the downstream announced a change.
    pub async fn list_tools(&self) -> Result<Vec<Value>> {
        if self.tools_stale.swap(false, Ordering::Relaxed) {
            match self.fetch_tools().await {
                Ok(tools) => {
                    *self.tools.lock().await = tools;
                }
                Err(err) => {
                    // Keep serving the previous cache; retry on next change.
                    self.tools_stale.store(true, Ordering::Relaxed);
                    tracing::warn!(server = %self.name, %err, "tool list refresh failed");
                }
            }
        }
        Ok(self.tools.lock().await.clone())
    }

    /// Sends `tools/call` and awaits the correlated response within `timeout`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        self.handle
            .request_with_timeout("tools/call", Some(params), timeout)
            .await
            .map_err(BridgeError::from)
    }

    /// Closes stdin, waits up to `grace` for a clean exit, then kills.
    pub async fn close(&self, grace: Duration) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle { client, child } = &mut *lifecycle;

        // Closing the jsonrpc client shuts the write end; a well-behaved
        // server exits on stdin EOF.
        let _ = client
            .wait_with_timeout(
                Duration::from_millis(50),
                sandbox_jsonrpc::WaitOnTimeout::ReturnError,
            )
            .await;

        let Some(child) = child else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if child.start_kill().is_ok() {
                    let _ = tokio::time::timeout(KILL_TIMEOUT, child.wait()).await;
                }
            }
        }
    }
}

impl Drop for DownstreamClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{echo_tool, scripted_client};

    #[tokio::test]
    async fn handshake_caches_the_tool_list() {
        let (client, _server) = scripted_client("stub", vec![echo_tool()]).await;
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");
        assert!(client.is_alive());
        assert!(!client.tools_stale());
    }

    #[tokio::test]
    async fn call_tool_round_trips_arguments() {
        let (client, _server) = scripted_client("stub", vec![echo_tool()]).await;
        let result = client
            .call_tool(
                "echo",
                serde_json::json!({ "message": "hi" }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("\"message\":\"hi\""));
    }

    #[tokio::test]
    async fn server_exit_marks_client_dead_and_fails_calls() {
        let (client, server) = scripted_client("stub", vec![echo_tool()]).await;
        server.abort();
        // Aborting the server drops its pipe end; the reader observes EOF.
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_alive() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let err = client
            .call_tool("echo", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "downstream_unavailable");
    }
}
