use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcp_sandbox_bridge::{serve, Bridge, Settings};

#[derive(Parser)]
#[command(name = "mcp-sandbox-bridge")]
#[command(about = "MCP bridge that runs model-written Python in a container sandbox")]
struct Cli {
    /// Directory for per-invocation IPC state (default: ./.mcp-bridge).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Extra server config file, scanned after the default locations.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter (overrides MCP_BRIDGE_LOG_LEVEL; e.g. "debug",
    /// "mcp_sandbox_bridge=trace").
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .or_else(|| std::env::var("MCP_BRIDGE_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    // Logs go to stderr; stdout belongs to the MCP channel.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::from_env();
    if let Some(state_dir) = cli.state_dir {
        settings.state_dir = state_dir;
    }
    if let Some(config) = cli.config {
        settings.config_path = Some(config);
    }

    let bridge = Arc::new(Bridge::load(settings).await?);
    serve(bridge).await
}
