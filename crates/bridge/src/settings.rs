use std::path::PathBuf;
use std::time::Duration;

/// Snapshot of the `MCP_BRIDGE_*` environment taken at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Explicit container runtime binary (otherwise podman, then docker).
    pub runtime: Option<String>,
    /// Container image for the sandbox.
    pub image: String,
    /// Default execution timeout in seconds.
    pub default_timeout: u64,
    /// Upper bound for the `timeout` tool argument, in seconds.
    pub max_timeout: u64,
    /// Container memory limit, passed through to `--memory`.
    pub memory: String,
    /// Container PID limit.
    pub pids: u32,
    /// Optional CPU limit, passed through to `--cpus`.
    pub cpus: Option<String>,
    /// uid:gid the sandbox runs as.
    pub container_user: String,
    /// Idle seconds before a podman machine is stopped. 0 disables.
    pub runtime_idle_timeout: u64,
    /// Host directory holding per-invocation IPC subdirectories.
    pub state_dir: PathBuf,
    pub output_mode: OutputMode,
    /// Extra config file scanned after the default locations.
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Compact,
    Toon,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: None,
            image: "python:3.12-slim".to_string(),
            default_timeout: 30,
            max_timeout: 120,
            memory: "512m".to_string(),
            pids: 128,
            cpus: None,
            container_user: "65534:65534".to_string(),
            runtime_idle_timeout: 300,
            state_dir: PathBuf::from("./.mcp-bridge"),
            output_mode: OutputMode::Compact,
            config_path: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            runtime: env_nonempty("MCP_BRIDGE_RUNTIME"),
            image: env_nonempty("MCP_BRIDGE_IMAGE").unwrap_or(defaults.image),
            default_timeout: env_parse("MCP_BRIDGE_TIMEOUT").unwrap_or(defaults.default_timeout),
            max_timeout: env_parse("MCP_BRIDGE_MAX_TIMEOUT").unwrap_or(defaults.max_timeout),
            memory: env_nonempty("MCP_BRIDGE_MEMORY").unwrap_or(defaults.memory),
            pids: env_parse("MCP_BRIDGE_PIDS").unwrap_or(defaults.pids),
            cpus: env_nonempty("MCP_BRIDGE_CPUS"),
            container_user: env_nonempty("MCP_BRIDGE_CONTAINER_USER")
                .unwrap_or(defaults.container_user),
            runtime_idle_timeout: env_parse("MCP_BRIDGE_RUNTIME_IDLE_TIMEOUT")
                .unwrap_or(defaults.runtime_idle_timeout),
            state_dir: env_nonempty("MCP_BRIDGE_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            output_mode: match env_nonempty("MCP_BRIDGE_OUTPUT_MODE").as_deref() {
                Some(mode) if mode.eq_ignore_ascii_case("toon") => OutputMode::Toon,
                _ => OutputMode::Compact,
            },
            config_path: env_nonempty("MCP_BRIDGE_CONFIG").map(PathBuf::from),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_idle_timeout)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|v| v.trim().parse().ok())
}
