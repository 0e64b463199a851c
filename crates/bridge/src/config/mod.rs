//! Server-record discovery.
//!
//! The bridge scans a fixed set of claude-style configuration files plus two
//! per-server config directories, collecting `mcpServers` entries into a flat
//! catalog. Records are immutable once loaded. Overlapping names resolve by
//! discovery order, last wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::naming::ServerName;

mod file_format;
mod load;

pub use load::load_catalog;

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Launch description for one downstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub name: ServerName,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// The full set of discovered server records, keyed (and ordered) by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    servers: BTreeMap<ServerName, ServerRecord>,
}

impl Catalog {
    pub fn new(servers: BTreeMap<ServerName, ServerRecord>) -> Self {
        Self { servers }
    }

    pub fn get(&self, name: &str) -> Option<&ServerRecord> {
        self.servers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &ServerName> {
        self.servers.keys()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Config files scanned for `mcpServers` objects, in precedence order
/// (later files win on name collisions).
pub fn default_config_paths(home: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home {
        paths.push(home.join(".claude.json"));
        let app_support = home.join("Library").join("Application Support");
        paths.push(
            app_support
                .join("Claude Code")
                .join("claude_code_config.json"),
        );
        paths.push(app_support.join("Claude").join("claude_desktop_config.json"));
    }
    paths.push(cwd.join("claude_code_config.json"));
    paths.push(cwd.join("claude_desktop_config.json"));
    paths
}

/// Directories whose `*.json` files each contribute `mcpServers` objects.
pub fn default_config_dirs(home: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = home {
        dirs.push(home.join(".config").join("mcp").join("servers"));
        dirs.push(
            home.join("Library")
                .join("Application Support")
                .join("Claude Code")
                .join("mcp")
                .join("servers"),
        );
    }
    dirs.push(cwd.join("mcp-servers"));
    dirs
}

#[cfg(test)]
mod tests;
