use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

/// Any JSON file carrying an `mcpServers` object. Unknown sibling keys are
/// common in claude config files and are ignored.
#[derive(Debug, Deserialize)]
pub(super) struct ConfigFile {
    #[serde(default, rename = "mcpServers")]
    pub(super) mcp_servers: BTreeMap<String, ServerEntry>,
    #[serde(flatten)]
    #[allow(dead_code)]
    pub(super) extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEntry {
    #[serde(default)]
    pub(super) command: Option<String>,
    #[serde(default)]
    pub(super) args: Vec<String>,
    #[serde(default)]
    pub(super) env: BTreeMap<String, String>,
    #[serde(default)]
    pub(super) cwd: Option<PathBuf>,
    #[serde(flatten)]
    #[allow(dead_code)]
    pub(super) extra: BTreeMap<String, Value>,
}
