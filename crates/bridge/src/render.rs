//! Assembles the outgoing `run_python` tool result.
//!
//! Two facets: `structuredContent` (the outcome record with empty fields
//! elided) and one text block, either a compact plain-text rendering or a
//! fenced token-oriented (TOON) block. The in-repo TOON encoder covers flat
//! records with scalar fields and primitive arrays; anything else falls back
//! to indented JSON, deterministically.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::settings::OutputMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// The outward result record of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Rendered MCP tool result.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub text: String,
    pub structured: Value,
    pub is_error: bool,
}

pub fn render(outcome: &RunOutcome, mode: OutputMode) -> ToolResponse {
    let structured = structured_content(outcome);
    let text = match mode {
        OutputMode::Compact => render_compact(outcome),
        OutputMode::Toon => render_toon_block(&structured),
    };
    ToolResponse {
        text,
        structured,
        is_error: outcome.status != RunStatus::Ok,
    }
}

/// The outcome record with empty strings, empty collections and absent
/// options elided.
fn structured_content(outcome: &RunOutcome) -> Value {
    let mut map = Map::new();
    map.insert(
        "status".to_string(),
        Value::String(outcome.status.as_str().to_string()),
    );
    if !outcome.stdout.is_empty() {
        map.insert("stdout".to_string(), Value::String(outcome.stdout.clone()));
    }
    if !outcome.stderr.is_empty() {
        map.insert("stderr".to_string(), Value::String(outcome.stderr.clone()));
    }
    if let Some(error) = &outcome.error {
        if !error.is_empty() {
            map.insert("error".to_string(), Value::String(error.clone()));
        }
    }
    if !outcome.servers.is_empty() {
        map.insert(
            "servers".to_string(),
            Value::Array(
                outcome
                    .servers
                    .iter()
                    .map(|server| Value::String(server.clone()))
                    .collect(),
            ),
        );
    }
    Value::Object(map)
}

/// Whitespace-only and noise-only lines are dropped from the text facet to
/// save tokens; the structured facet keeps the full streams.
fn meaningful_lines(stream: &str) -> Vec<&str> {
    stream
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && trimmed != "()"
        })
        .collect()
}

fn render_compact(outcome: &RunOutcome) -> String {
    let mut lines: Vec<String> = Vec::new();
    if outcome.status != RunStatus::Ok {
        lines.push(format!("status: {}", outcome.status.as_str()));
    }

    let stdout_lines = meaningful_lines(&outcome.stdout);
    if !stdout_lines.is_empty() {
        lines.push(stdout_lines.join("\n"));
    }
    let stderr_lines = meaningful_lines(&outcome.stderr);
    if !stderr_lines.is_empty() {
        lines.push(format!("stderr:\n{}", stderr_lines.join("\n")));
    }
    if let Some(error) = outcome.error.as_deref().filter(|e| !e.is_empty()) {
        lines.push(format!("error: {error}"));
    }

    let text = lines.join("\n").trim().to_string();
    if !text.is_empty() {
        return text;
    }
    match outcome.status {
        RunStatus::Ok => "Success (no output)".to_string(),
        status => status.as_str().to_string(),
    }
}

fn render_toon_block(payload: &Value) -> String {
    match encode_toon(payload) {
        Some(body) if body.is_empty() => "```toon\n```".to_string(),
        Some(body) => format!("```toon\n{body}\n```"),
        None => {
            let fallback =
                serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string());
            format!("```json\n{fallback}\n```")
        }
    }
}

/// TOON subset: one `key: value` line per scalar field, `key[N]: a,b,c` per
/// primitive array. Returns `None` for shapes the subset cannot express.
fn encode_toon(payload: &Value) -> Option<String> {
    let Value::Object(map) = payload else {
        return None;
    };

    let mut lines = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                let encoded: Option<Vec<String>> = items.iter().map(encode_toon_scalar).collect();
                lines.push(format!("{key}[{}]: {}", items.len(), encoded?.join(",")));
            }
            value => lines.push(format!("{key}: {}", encode_toon_scalar(value)?)),
        }
    }
    Some(lines.join("\n"))
}

fn encode_toon_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null".to_string()),
        Value::Bool(value) => Some(value.to_string()),
        Value::Number(value) => Some(value.to_string()),
        Value::String(value) => {
            let needs_quoting = value.is_empty()
                || value.starts_with(char::is_whitespace)
                || value.ends_with(char::is_whitespace)
                || value.contains([',', ':', '"', '\n', '\r']);
            if needs_quoting {
                // JSON escaping keeps the value on one line.
                Some(serde_json::to_string(value).ok()?)
            } else {
                Some(value.clone())
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}
