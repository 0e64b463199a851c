//! Container runtime selection and podman machine lifecycle.
//!
//! Resolution order: explicit override, then `podman`, then `docker`; the
//! first binary answering a version probe wins (each probe gets one retry).
//! On hosts where podman needs a VM, the machine is started on first use and
//! stopped again after the configured idle interval with no outstanding
//! invocations. Outstanding invocations hold a [`RuntimeLease`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{BridgeError, Result};

const MACHINE_ATTEMPTS: usize = 3;

pub struct RuntimeSelector {
    override_binary: Option<String>,
    idle_timeout: Duration,
    state: tokio::sync::Mutex<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    binary: Option<String>,
    machine_ready: bool,
    active: u32,
    idle_task: Option<tokio::task::JoinHandle<()>>,
    shared_paths: HashSet<PathBuf>,
}

/// Held for the duration of one sandbox invocation; keeps the VM warm.
pub struct RuntimeLease {
    selector: Arc<RuntimeSelector>,
    pub binary: String,
}

impl Drop for RuntimeLease {
    fn drop(&mut self) {
        let selector = self.selector.clone();
        tokio::spawn(async move {
            selector.release().await;
        });
    }
}

impl RuntimeSelector {
    pub fn new(override_binary: Option<String>, idle_timeout: Duration) -> Self {
        Self {
            override_binary,
            idle_timeout,
            state: tokio::sync::Mutex::new(RuntimeState::default()),
        }
    }

    /// Resolves (and caches) the runtime binary.
    pub async fn binary(&self) -> Result<String> {
        {
            let state = self.state.lock().await;
            if let Some(binary) = &state.binary {
                return Ok(binary.clone());
            }
        }

        for candidate in candidates(self.override_binary.as_deref()) {
            if probe_version(&candidate).await || probe_version(&candidate).await {
                tracing::info!(runtime = %candidate, "selected container runtime");
                let mut state = self.state.lock().await;
                state.binary = Some(candidate.clone());
                return Ok(candidate);
            }
        }

        Err(BridgeError::RuntimeUnavailable(
            "no container runtime found; install podman or rootless docker, or set \
             MCP_BRIDGE_RUNTIME"
                .to_string(),
        ))
    }

    /// Warms the runtime up (podman machine start if required) and takes a
    /// lease that defers idle shutdown until released.
    pub async fn acquire(self: &Arc<Self>) -> Result<RuntimeLease> {
        let binary = self.binary().await?;

        let mut state = self.state.lock().await;
        if let Some(task) = state.idle_task.take() {
            task.abort();
        }
        if is_podman(&binary) && !state.machine_ready {
            ensure_machine(&binary).await?;
            state.machine_ready = true;
        }
        state.active += 1;
        Ok(RuntimeLease {
            selector: self.clone(),
            binary,
        })
    }

    async fn release(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        if state.active > 0 || self.idle_timeout.is_zero() {
            return;
        }
        let Some(binary) = state.binary.clone() else {
            return;
        };
        if !is_podman(&binary) {
            return;
        }

        if let Some(task) = state.idle_task.take() {
            task.abort();
        }
        let selector = self.clone();
        let idle_timeout = self.idle_timeout;
        state.idle_task = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let mut state = selector.state.lock().await;
            if state.active > 0 {
                return;
            }
            state.machine_ready = false;
            drop(state);
            stop_machine(&binary).await;
        }));
    }

    /// Shares a host directory into the podman VM so bind mounts under it
    /// work. No-op for docker and for already-shared paths.
    pub async fn ensure_shared_dir(&self, path: &Path) -> Result<()> {
        let binary = self.binary().await?;
        if !is_podman(&binary) {
            return Ok(());
        }

        let resolved = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        {
            let state = self.state.lock().await;
            if state.shared_paths.contains(&resolved) {
                return Ok(());
            }
        }

        let spec = format!("{}:{}", resolved.display(), resolved.display());
        let (code, _stdout, stderr) = run(
            &binary,
            &["machine", "set", "--rootful", "--volume", &spec],
        )
        .await?;
        let lower = stderr.to_lowercase();
        if code == 0 || lower.contains("already exists") || lower.contains("would overwrite") {
            let mut state = self.state.lock().await;
            state.shared_paths.insert(resolved);
            return Ok(());
        }

        tracing::debug!(path = %resolved.display(), stderr = %stderr.trim(), "machine volume share failed");
        Ok(())
    }
}

fn candidates(override_binary: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(binary) = override_binary {
        candidates.push(binary.to_string());
    }
    for default in ["podman", "docker"] {
        if !candidates.iter().any(|c| c == default) {
            candidates.push(default.to_string());
        }
    }
    candidates
}

fn is_podman(binary: &str) -> bool {
    Path::new(binary)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains("podman"))
}

async fn probe_version(binary: &str) -> bool {
    matches!(run(binary, &["--version"]).await, Ok((0, _, _)))
}

/// Whether a failed `info` means "the machine is not running" as opposed to a
/// broken installation.
fn machine_needs_start(combined_output: &str) -> bool {
    let lower = combined_output.to_lowercase();
    [
        "cannot connect to podman",
        "podman machine",
        "run the podman machine",
        "socket: connect",
    ]
    .iter()
    .any(|phrase| lower.contains(phrase))
}

async fn ensure_machine(binary: &str) -> Result<()> {
    for _ in 0..MACHINE_ATTEMPTS {
        let (code, stdout, stderr) = run(binary, &["info", "--format", "{{json .}}"]).await?;
        if code == 0 {
            return Ok(());
        }

        let combined = format!("{stdout}\n{stderr}");
        if !machine_needs_start(&combined) {
            return Err(BridgeError::RuntimeUnavailable(format!(
                "container runtime is unavailable: {}",
                stderr.trim()
            )));
        }

        let (start_code, start_stdout, start_stderr) = run(binary, &["machine", "start"]).await?;
        if start_code == 0 {
            continue;
        }

        let start_combined = format!("{start_stdout}\n{start_stderr}").to_lowercase();
        if start_combined.contains("does not exist") || start_combined.contains("no such machine") {
            let (init_code, _init_stdout, init_stderr) = run(binary, &["machine", "init"]).await?;
            if init_code != 0 {
                return Err(BridgeError::RuntimeUnavailable(format!(
                    "failed to initialize podman machine: {}",
                    init_stderr.trim()
                )));
            }
            continue;
        }

        return Err(BridgeError::RuntimeUnavailable(format!(
            "failed to start podman machine: {}",
            start_stderr.trim()
        )));
    }

    Err(BridgeError::RuntimeUnavailable(
        "repeated podman machine start attempts failed".to_string(),
    ))
}

async fn stop_machine(binary: &str) {
    match run(binary, &["machine", "stop"]).await {
        Ok((0, _, _)) => {
            tracing::info!("stopped idle podman machine");
        }
        Ok((_, stdout, stderr)) => {
            let combined = format!("{stdout}\n{stderr}").to_lowercase();
            if !combined.contains("already stopped") && !combined.contains("is not running") {
                tracing::debug!(stderr = %stderr.trim(), "failed to stop podman machine");
            }
        }
        Err(err) => {
            tracing::debug!(%err, "failed to stop podman machine");
        }
    }
}

async fn run(binary: &str, args: &[&str]) -> Result<(i32, String, String)> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| BridgeError::RuntimeUnavailable(format!("{binary}: {err}")))?;
    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_probes_first_then_podman_then_docker() {
        assert_eq!(candidates(None), vec!["podman", "docker"]);
        assert_eq!(
            candidates(Some("/usr/local/bin/nerdctl")),
            vec!["/usr/local/bin/nerdctl", "podman", "docker"]
        );
        // An override equal to a default is not probed twice.
        assert_eq!(candidates(Some("docker")), vec!["docker", "podman"]);
    }

    #[test]
    fn podman_detection_uses_the_basename() {
        assert!(is_podman("podman"));
        assert!(is_podman("/opt/homebrew/bin/podman"));
        assert!(is_podman("podman-remote"));
        assert!(!is_podman("docker"));
        assert!(!is_podman("/podman-tools/docker"));
    }

    #[test]
    fn machine_start_is_only_attempted_for_connection_errors() {
        assert!(machine_needs_start(
            "Cannot connect to Podman. Please verify your connection"
        ));
        assert!(machine_needs_start("socket: connect: no such file"));
        assert!(!machine_needs_start("permission denied"));
    }

    #[tokio::test]
    async fn missing_runtime_is_reported_as_unavailable() {
        let selector = RuntimeSelector::new(
            Some("/nonexistent/container-runtime".to_string()),
            Duration::ZERO,
        );
        // The override fails to probe and the fallbacks may or may not exist
        // on the build host; only assert the override path alone.
        assert!(!probe_version("/nonexistent/container-runtime").await);
        drop(selector);
    }
}
