//! Per-request orchestration: validation, IPC directory lifecycle, the
//! container child, the two stdio pumps, and the deadline.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::dispatcher::Dispatcher;
use crate::discovery::DiscoveryService;
use crate::entrypoint;
use crate::error::{BridgeError, Result};
use crate::frame::{self, DoneStatus, Frame, MAX_FRAME_BYTES};
use crate::naming::ServerName;
use crate::pool::ClientPool;
use crate::render::RunStatus;
use crate::sandbox::{self, LaunchPlan, KILL_BACKSTOP};
use crate::settings::Settings;

/// How long an exited-pump invocation waits for the child before killing it.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// The `run_python` arguments after §4.5 validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub code: String,
    pub servers: Vec<ServerName>,
    pub timeout_seconds: u64,
}

/// Validates tool arguments. Rejections here never spawn a sandbox.
pub fn validate(
    code: &str,
    servers: &[String],
    timeout: Option<i64>,
    settings: &Settings,
) -> Result<ValidatedRequest> {
    if code.trim().is_empty() {
        return Err(BridgeError::InvalidRequest(
            "'code' must be a non-empty string".to_string(),
        ));
    }

    let timeout_seconds = match timeout {
        None => settings.default_timeout,
        Some(value) if value < 1 => {
            return Err(BridgeError::InvalidRequest(format!(
                "'timeout' must be a positive integer, got {value}"
            )));
        }
        // Values beyond the ceiling are clamped rather than rejected.
        Some(value) => (value as u64).min(settings.max_timeout),
    };

    // Duplicates are removed, first occurrence order preserved.
    let mut servers_out: Vec<ServerName> = Vec::new();
    for raw in servers {
        let name = ServerName::parse(raw).map_err(|err| {
            BridgeError::InvalidRequest(format!("invalid server name {raw:?}: {err}"))
        })?;
        if !servers_out.contains(&name) {
            servers_out.push(name);
        }
    }

    Ok(ValidatedRequest {
        code: code.to_string(),
        servers: servers_out,
        timeout_seconds,
    })
}

/// Raw output of one sandbox run, before rendering.
#[derive(Debug)]
pub struct SandboxRun {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

pub struct SandboxInvocation {
    pub id: String,
    pub servers: Vec<ServerName>,
    pub timeout_seconds: u64,
    ipc_dir: PathBuf,
    cleaned: bool,
}

impl SandboxInvocation {
    /// Creates the per-invocation IPC directory under the state dir and
    /// writes the generated entrypoint into it.
    pub async fn prepare(
        settings: &Settings,
        sequence: u64,
        request: &ValidatedRequest,
    ) -> Result<Self> {
        let id = format!("inv-{}-{sequence}", std::process::id());
        let ipc_dir = settings.state_dir.join(&id);
        tokio::fs::create_dir_all(&ipc_dir).await.map_err(|err| {
            BridgeError::SandboxCrash(format!(
                "failed to create ipc directory {}: {err}",
                ipc_dir.display()
            ))
        })?;

        // The sandbox user (65534) must be able to traverse the directory
        // and read the entrypoint.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&ipc_dir, std::fs::Permissions::from_mode(0o755))
                .await;
        }

        let entrypoint_path = ipc_dir.join("entrypoint.py");
        tokio::fs::write(&entrypoint_path, entrypoint::render(&request.code))
            .await
            .map_err(|err| {
                BridgeError::SandboxCrash(format!("failed to write entrypoint: {err}"))
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(
                &entrypoint_path,
                std::fs::Permissions::from_mode(0o644),
            )
            .await;
        }

        Ok(Self {
            id,
            servers: request.servers.clone(),
            timeout_seconds: request.timeout_seconds,
            ipc_dir,
            cleaned: false,
        })
    }

    pub fn ipc_dir(&self) -> &PathBuf {
        &self.ipc_dir
    }

    /// Spawns the container and drives it to completion: pumps frames,
    /// routes requests through the dispatcher, enforces the deadline.
    pub async fn run(
        &self,
        plan: &LaunchPlan,
        pool: Arc<ClientPool>,
        discovery: Arc<DiscoveryService>,
    ) -> SandboxRun {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.timeout_seconds);

        let mut child = match sandbox::spawn(plan) {
            Ok(child) => child,
            Err(err) => {
                return SandboxRun {
                    status: RunStatus::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(
                        BridgeError::SandboxCrash(format!("failed to spawn container: {err}"))
                            .tagged()
                            .to_string(),
                    ),
                };
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            return SandboxRun {
                status: RunStatus::Error,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(
                    BridgeError::SandboxCrash("container stdio not captured".to_string())
                        .tagged()
                        .to_string(),
                ),
            };
        };

        let dispatcher = Arc::new(Dispatcher::new(
            self.servers.clone(),
            pool,
            discovery,
            stdin,
            deadline,
            self.timeout_seconds,
        ));

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let raw_stderr_buf = stderr_buf.clone();
        let stderr_pump = tokio::spawn(async move {
            let mut stderr = stderr;
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                        lock_buf(&raw_stderr_buf).push_str(&text);
                    }
                }
            }
        });

        let pump_dispatcher = dispatcher.clone();
        let pump_stdout_buf = stdout_buf.clone();
        let pump_stderr_buf = stderr_buf.clone();
        let mut stdout_pump = tokio::spawn(async move {
            pump_frames(stdout, pump_dispatcher, pump_stdout_buf, pump_stderr_buf).await
        });

        let outcome = tokio::select! {
            pumped = &mut stdout_pump => {
                let pumped = pumped.unwrap_or_else(|_| {
                    Err(BridgeError::Protocol("frame pump failed".to_string()))
                });
                match pumped {
                    Ok(done) => {
                        let exit_code = match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await
                        {
                            Ok(Ok(status)) => status.code(),
                            _ => {
                                let _ = child.start_kill();
                                let _ = tokio::time::timeout(KILL_BACKSTOP, child.wait()).await;
                                None
                            }
                        };
                        dispatcher.drain().await;
                        finish(done, exit_code)
                    }
                    Err(protocol_err) => {
                        // Malformed frame: terminate the container.
                        dispatcher.drain().await;
                        sandbox::stop_container(&plan.binary, &plan.container_name).await;
                        let _ = child.start_kill();
                        let _ = tokio::time::timeout(KILL_BACKSTOP, child.wait()).await;
                        (RunStatus::Error, None, Some(protocol_err.tagged().to_string()))
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                dispatcher.fail_pending_with_timeout().await;
                sandbox::stop_container(&plan.binary, &plan.container_name).await;
                let exit_code = match tokio::time::timeout(KILL_BACKSTOP, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    _ => {
                        let _ = child.start_kill();
                        let _ = tokio::time::timeout(KILL_BACKSTOP, child.wait()).await;
                        None
                    }
                };
                stdout_pump.abort();
                let err = BridgeError::SandboxTimeout(self.timeout_seconds);
                (RunStatus::Timeout, exit_code, Some(err.tagged().to_string()))
            }
        };
        let _ = stderr_pump.await;

        let (status, exit_code, error) = outcome;
        let stdout = std::mem::take(&mut *lock_buf(&stdout_buf));
        let mut stderr = std::mem::take(&mut *lock_buf(&stderr_buf));
        if status == RunStatus::Ok {
            stderr = sandbox::filter_runtime_stderr(&plan.binary, &stderr);
        }

        SandboxRun {
            status,
            exit_code,
            stdout,
            stderr,
            error,
        }
    }

    /// Removes the IPC directory. Called on every exit path; the `Drop`
    /// backstop covers panics.
    pub async fn cleanup(mut self) {
        self.cleaned = true;
        if let Err(err) = tokio::fs::remove_dir_all(&self.ipc_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.ipc_dir.display(), %err, "failed to remove ipc directory");
            }
        }
    }
}

impl Drop for SandboxInvocation {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.ipc_dir);
        }
    }
}

/// Maps the `done` frame and exit code to a run status.
fn finish(
    done: Option<(DoneStatus, Option<String>)>,
    exit_code: Option<i32>,
) -> (RunStatus, Option<i32>, Option<String>) {
    match done {
        Some((DoneStatus::Ok, _)) if exit_code == Some(0) => (RunStatus::Ok, exit_code, None),
        Some((DoneStatus::Ok, _)) => (
            RunStatus::Error,
            exit_code,
            Some(format!(
                "sandbox exited with code {}",
                exit_code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
            )),
        ),
        Some((DoneStatus::Error, error)) => (
            RunStatus::Error,
            exit_code,
            Some(error.unwrap_or_else(|| "sandbox reported an error".to_string())),
        ),
        None => (
            RunStatus::Error,
            exit_code,
            Some(
                BridgeError::SandboxCrash(format!(
                    "container exited without completion status (exit code {})",
                    exit_code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
                ))
                .tagged()
                .to_string(),
            ),
        ),
    }
}

type Done = Option<(DoneStatus, Option<String>)>;

async fn pump_frames(
    stdout: tokio::process::ChildStdout,
    dispatcher: Arc<Dispatcher>,
    stdout_buf: Arc<Mutex<String>>,
    stderr_buf: Arc<Mutex<String>>,
) -> Result<Done> {
    let mut reader = tokio::io::BufReader::new(stdout);
    let mut done: Done = None;
    loop {
        match sandbox_jsonrpc::read_line_limited(&mut reader, MAX_FRAME_BYTES).await {
            Ok(Some(line)) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match frame::decode(&line)? {
                    Frame::Stdout { data } => lock_buf(&stdout_buf).push_str(&data),
                    Frame::Stderr { data } => lock_buf(&stderr_buf).push_str(&data),
                    Frame::Request { id, method, params } => {
                        dispatcher.dispatch(id, method, params).await;
                    }
                    Frame::Done { status, error } => {
                        done = Some((status, error));
                    }
                    Frame::Response { .. } => {
                        return Err(BridgeError::Protocol(
                            "unexpected response frame from sandbox".to_string(),
                        ));
                    }
                }
            }
            Ok(None) => return Ok(done),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                return Err(BridgeError::Protocol(format!(
                    "frame exceeds {MAX_FRAME_BYTES} bytes"
                )));
            }
            Err(err) => {
                return Err(BridgeError::Protocol(format!(
                    "sandbox stdout read failed: {err}"
                )));
            }
        }
    }
}

fn lock_buf(buf: &Arc<Mutex<String>>) -> std::sync::MutexGuard<'_, String> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_state_dir(dir: &std::path::Path) -> Settings {
        Settings {
            state_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }

    #[test]
    fn empty_code_is_invalid() {
        let settings = Settings::default();
        let err = validate("", &[], None, &settings).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        let err = validate("   \n", &[], None, &settings).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn non_positive_timeouts_are_invalid() {
        let settings = Settings::default();
        for timeout in [0, -1, -30] {
            let err = validate("print(1)", &[], Some(timeout), &settings).unwrap_err();
            assert_eq!(err.kind(), "invalid_request");
        }
    }

    #[test]
    fn oversized_timeouts_clamp_to_the_ceiling() {
        let settings = Settings::default();
        let request = validate("print(1)", &[], Some(9999), &settings).unwrap();
        assert_eq!(request.timeout_seconds, settings.max_timeout);
        let request = validate("print(1)", &[], None, &settings).unwrap();
        assert_eq!(request.timeout_seconds, settings.default_timeout);
    }

    #[test]
    fn duplicate_servers_dedupe_preserving_order() {
        let settings = Settings::default();
        let servers = vec![
            "beta".to_string(),
            "alpha".to_string(),
            "beta".to_string(),
            "alpha".to_string(),
        ];
        let request = validate("print(1)", &servers, None, &settings).unwrap();
        let names: Vec<_> = request.servers.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["beta", "alpha"]);
    }

    #[test]
    fn malformed_server_names_are_invalid() {
        let settings = Settings::default();
        let err = validate("print(1)", &["bad name".to_string()], None, &settings).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn prepare_writes_the_entrypoint_and_cleanup_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_state_dir(dir.path());
        let request = validate("print(1 + 1)", &[], None, &settings).unwrap();

        let invocation = SandboxInvocation::prepare(&settings, 1, &request)
            .await
            .unwrap();
        let ipc_dir = invocation.ipc_dir().clone();
        let entrypoint = ipc_dir.join("entrypoint.py");
        assert!(entrypoint.is_file());
        let script = tokio::fs::read_to_string(&entrypoint).await.unwrap();
        assert!(script.contains("print(1 + 1)"));

        invocation.cleanup().await;
        assert!(!ipc_dir.exists(), "ipc dir must not survive the invocation");
    }

    #[tokio::test]
    async fn ipc_directories_are_unique_per_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_state_dir(dir.path());
        let request = validate("print(1)", &[], None, &settings).unwrap();

        let first = SandboxInvocation::prepare(&settings, 1, &request)
            .await
            .unwrap();
        let second = SandboxInvocation::prepare(&settings, 2, &request)
            .await
            .unwrap();
        assert_ne!(first.ipc_dir(), second.ipc_dir());
        first.cleanup().await;
        second.cleanup().await;
    }

    #[tokio::test]
    async fn drop_backstop_removes_the_ipc_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_state_dir(dir.path());
        let request = validate("print(1)", &[], None, &settings).unwrap();

        let invocation = SandboxInvocation::prepare(&settings, 3, &request)
            .await
            .unwrap();
        let ipc_dir = invocation.ipc_dir().clone();
        drop(invocation);
        assert!(!ipc_dir.exists());
    }
}
