//! Lazy, paged tool documentation.
//!
//! Discovery answers come from pool metadata so the outward `run_python`
//! schema stays near-constant in size no matter how many downstream servers
//! exist. Tool lists are treated as eventually consistent: metadata is
//! rebuilt when the downstream announced a change, and `query_tool_docs` for
//! a not-yet-started server causes a just-in-time start.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Catalog;
use crate::error::{BridgeError, Result};
use crate::naming::{AliasAllocator, ServerName};
use crate::pool::ClientPool;

pub const CAPABILITY_RESOURCE_URI: &str = "resource://mcp-sandbox-bridge/capabilities";

pub const SANDBOX_HELPERS_SUMMARY: &str = "Helpers (after `import mcp.runtime as runtime`): await runtime.list_servers() or call \
     runtime.list_servers_sync(), runtime.discovered_servers(), runtime.list_tools[_sync](server), \
     runtime.query_tool_docs[_sync], runtime.search_tool_docs[_sync], runtime.describe_server(name) \
     (includes 'cwd' if configured), runtime.list_loaded_server_metadata(), \
     runtime.capability_summary() (prints this digest). Loaded servers also expose mcp_<alias> \
     proxies.";

pub const CAPABILITY_SUMMARY: &str = "Executes Python in a locked-down, single-use container sandbox. Downstream MCP servers \
     requested via the 'servers' argument are exposed as mcp_<alias> proxies and as \
     mcp.servers.<alias> modules; tool docs are paged on demand through the runtime helpers \
     instead of being pre-loaded into the tool schema.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Detail {
    #[default]
    Summary,
    Full,
}

impl Detail {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.eq_ignore_ascii_case("full") => Self::Full,
            _ => Self::Summary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDoc {
    pub name: String,
    pub alias: String,
    pub description: String,
    pub input_schema: Option<Value>,
    keywords: String,
}

#[derive(Debug, Clone)]
pub struct ServerMetadata {
    pub name: ServerName,
    pub alias: String,
    pub cwd: Option<String>,
    pub tools: Vec<ToolDoc>,
}

impl ServerMetadata {
    /// Catalog entry shape shipped to the sandbox via the environment.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "alias": self.alias,
            "cwd": self.cwd,
            "tools": self
                .tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "name": tool.name,
                        "alias": tool.alias,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

pub struct DiscoveryService {
    catalog: Arc<Catalog>,
    pool: Arc<ClientPool>,
    cache: tokio::sync::Mutex<Cache>,
}

#[derive(Default)]
struct Cache {
    server_aliases: AliasAllocator,
    assigned: BTreeMap<ServerName, String>,
    servers: BTreeMap<ServerName, Arc<ServerMetadata>>,
}

impl DiscoveryService {
    pub fn new(catalog: Arc<Catalog>, pool: Arc<ClientPool>) -> Self {
        Self {
            catalog,
            pool,
            cache: tokio::sync::Mutex::new(Cache::default()),
        }
    }

    /// Ordered names of every known server.
    pub fn discovered_servers(&self) -> Vec<String> {
        self.catalog
            .names()
            .map(|name| name.to_string())
            .collect()
    }

    /// Servers that can still be requested (known and not permanently
    /// broken).
    pub async fn list_servers(&self) -> Vec<String> {
        let mut servers = Vec::new();
        for name in self.catalog.names() {
            if !self.pool.is_failed(name.as_str()).await {
                servers.push(name.to_string());
            }
        }
        servers
    }

    pub fn capability_summary(&self) -> &'static str {
        CAPABILITY_SUMMARY
    }

    /// Tool aliases for a server, starting it just in time if needed.
    pub async fn list_tools(&self, server: &ServerName) -> Result<Vec<String>> {
        let metadata = self.metadata(server).await?;
        Ok(metadata.tools.iter().map(|tool| tool.alias.clone()).collect())
    }

    /// Summaries by default; `Detail::Full` adds the input schema. With
    /// `tool` set, resolves by alias or raw name (case-insensitive) and
    /// returns exactly one doc.
    pub async fn query_tool_docs(
        &self,
        server: &ServerName,
        tool: Option<&str>,
        detail: Detail,
    ) -> Result<Vec<Value>> {
        let metadata = self.metadata(server).await?;
        match tool {
            None => Ok(metadata
                .tools
                .iter()
                .map(|doc| format_tool_doc(&metadata, doc, detail))
                .collect()),
            Some(tool) => {
                let target = tool.to_lowercase();
                let doc = metadata
                    .tools
                    .iter()
                    .find(|doc| {
                        doc.alias.to_lowercase() == target || doc.name.to_lowercase() == target
                    })
                    .ok_or_else(|| {
                        BridgeError::InvalidRequest(format!(
                            "tool {tool:?} not found for server {server}"
                        ))
                    })?;
                Ok(vec![format_tool_doc(&metadata, doc, detail)])
            }
        }
    }

    /// Case-insensitive all-tokens-match ranking across cached names and
    /// descriptions of the allowed servers; ties break by server order then
    /// tool order. `limit` clamps to 1..=20.
    pub async fn search_tool_docs(
        &self,
        query: &str,
        allowed: &[ServerName],
        limit: i64,
        detail: Detail,
    ) -> Result<Vec<Value>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let capped = limit.clamp(1, 20) as usize;

        let mut matches = Vec::new();
        for server in allowed {
            let metadata = self.metadata(server).await?;
            for doc in &metadata.tools {
                if tokens.iter().all(|token| doc.keywords.contains(token)) {
                    matches.push(format_tool_doc(&metadata, doc, detail));
                    if matches.len() >= capped {
                        return Ok(matches);
                    }
                }
            }
        }
        Ok(matches)
    }

    /// Server record plus cached tool list.
    pub async fn describe_server(&self, server: &ServerName) -> Result<Value> {
        let metadata = self.metadata(server).await?;
        Ok(metadata.to_value())
    }

    /// Metadata for the sandbox catalog envelope.
    pub async fn server_metadata(&self, server: &ServerName) -> Result<Arc<ServerMetadata>> {
        self.metadata(server).await
    }

    async fn metadata(&self, server: &ServerName) -> Result<Arc<ServerMetadata>> {
        if !self.catalog.contains(server.as_str()) {
            return Err(BridgeError::UnknownServer(server.to_string()));
        }

        let stale = match self.pool.ready(server.as_str()).await {
            Some(client) => client.tools_stale(),
            None => false,
        };
        if !stale {
            let cache = self.cache.lock().await;
            if let Some(metadata) = cache.servers.get(server) {
                return Ok(metadata.clone());
            }
        }

        // Just-in-time start: listing tools pulls the server up if cold.
        let tool_specs = self.pool.list_tools(server).await?;
        let cwd = self
            .catalog
            .get(server.as_str())
            .and_then(|record| record.cwd.as_ref())
            .map(|cwd| cwd.display().to_string());

        let mut cache = self.cache.lock().await;
        let alias = match cache.assigned.get(server).cloned() {
            Some(alias) => alias,
            None => {
                let alias = cache.server_aliases.assign(server.as_str(), "server");
                cache.assigned.insert(server.clone(), alias.clone());
                alias
            }
        };

        let mut tool_aliases = AliasAllocator::new();
        let tools = tool_specs
            .iter()
            .map(|spec| {
                let name = spec
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("tool")
                    .to_string();
                let tool_alias = tool_aliases.assign(&name, "tool");
                let description = spec
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let input_schema = spec
                    .get("inputSchema")
                    .or_else(|| spec.get("input_schema"))
                    .cloned();
                let keywords = format!(
                    "{} {} {} {} {}",
                    server.as_str(),
                    alias,
                    name,
                    tool_alias,
                    description
                )
                .to_lowercase();
                ToolDoc {
                    name,
                    alias: tool_alias,
                    description,
                    input_schema,
                    keywords,
                }
            })
            .collect();

        let metadata = Arc::new(ServerMetadata {
            name: server.clone(),
            alias,
            cwd,
            tools,
        });
        cache.servers.insert(server.clone(), metadata.clone());
        Ok(metadata)
    }
}

fn format_tool_doc(metadata: &ServerMetadata, doc: &ToolDoc, detail: Detail) -> Value {
    let mut value = serde_json::json!({
        "server": metadata.name,
        "serverAlias": metadata.alias,
        "tool": doc.name,
        "toolAlias": doc.alias,
    });
    if !doc.description.is_empty() {
        value["description"] = Value::String(doc.description.clone());
    }
    if detail == Detail::Full {
        if let Some(schema) = &doc.input_schema {
            value["inputSchema"] = schema.clone();
        }
    }
    value
}
