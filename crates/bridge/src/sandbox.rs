//! Container launch policy and teardown.
//!
//! Every invocation gets a freshly launched, strictly confined container:
//! no network, read-only root, all capabilities dropped, no-new-privileges,
//! an unprivileged user, memory/PID/CPU limits, and tmpfs work directories
//! mounted noexec. Containers are never reused. On deadline the runtime's
//! own `stop` command delivers SIGTERM, waits the grace window, then
//! SIGKILLs.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::settings::Settings;

/// SIGTERM-to-SIGKILL window at deadline, in seconds.
pub const STOP_GRACE_SECONDS: u64 = 2;
/// Backstop for the bridge-side child process after a container stop.
pub const KILL_BACKSTOP: Duration = Duration::from_secs(2);

/// Image-pull chatter podman writes to stderr on first use; dropped from
/// successful results so quiet runs stay quiet.
const PODMAN_PULL_PREFIXES: &[&str] = &[
    "Resolved \"",
    "Trying to pull",
    "Getting image source signatures",
    "Copying blob",
    "Copying config",
    "Extracting",
    "Writing manifest",
    "Storing signatures",
];

/// A fully built `run` invocation for one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub binary: String,
    pub container_name: String,
    pub args: Vec<String>,
}

/// Builds the container argument vector for one invocation.
pub fn build_launch(
    binary: &str,
    settings: &Settings,
    invocation_id: &str,
    ipc_dir: &Path,
    env: &[(String, String)],
) -> LaunchPlan {
    let container_name = format!("mcp-sandbox-{invocation_id}");
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--interactive".into(),
        "--name".into(),
        container_name.clone(),
        "--network".into(),
        "none".into(),
        "--read-only".into(),
        "--pids-limit".into(),
        settings.pids.to_string(),
        "--memory".into(),
        settings.memory.clone(),
        "--tmpfs".into(),
        "/tmp:rw,noexec,nosuid,nodev,size=64m".into(),
        "--tmpfs".into(),
        "/workspace:rw,noexec,nosuid,nodev,size=128m".into(),
        "--workdir".into(),
        "/workspace".into(),
        "--env".into(),
        "HOME=/workspace".into(),
        "--env".into(),
        "PYTHONUNBUFFERED=1".into(),
        "--env".into(),
        "PYTHONIOENCODING=utf-8".into(),
        "--env".into(),
        "PYTHONDONTWRITEBYTECODE=1".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--user".into(),
        settings.container_user.clone(),
    ];
    if let Some(cpus) = &settings.cpus {
        args.push("--cpus".into());
        args.push(cpus.clone());
    }
    args.push("--volume".into());
    args.push(format!("{}:/ipc:rw", ipc_dir.display()));
    for (key, value) in env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    args.push(settings.image.clone());
    args.push("python3".into());
    args.push("-u".into());
    args.push("/ipc/entrypoint.py".into());

    LaunchPlan {
        binary: binary.to_string(),
        container_name,
        args,
    }
}

/// Spawns the container process with fully piped stdio.
pub fn spawn(plan: &LaunchPlan) -> std::io::Result<tokio::process::Child> {
    Command::new(&plan.binary)
        .args(&plan.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// SIGTERM, grace window, SIGKILL, via the runtime's own stop command.
pub async fn stop_container(binary: &str, container_name: &str) {
    let timeout_arg = STOP_GRACE_SECONDS.to_string();
    let result = Command::new(binary)
        .args(["stop", "--time", &timeout_arg, container_name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = result {
        tracing::debug!(container = container_name, %err, "container stop failed");
    }
}

/// Strips known podman pull chatter from stderr of successful runs.
pub fn filter_runtime_stderr(binary: &str, text: &str) -> String {
    let runtime_name = Path::new(binary)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(binary)
        .to_lowercase();
    if !runtime_name.contains("podman") || text.is_empty() {
        return text.to_string();
    }

    let filtered: Vec<&str> = text
        .lines()
        .filter(|line| {
            let stripped = line.trim();
            stripped.is_empty()
                || !PODMAN_PULL_PREFIXES
                    .iter()
                    .any(|prefix| stripped.starts_with(prefix))
        })
        .collect();
    filtered.join("\n").trim_matches('\n').to_string()
}
