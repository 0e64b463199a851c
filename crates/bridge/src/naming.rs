//! Server names and the sandbox-facing alias scheme.
//!
//! An alias is a valid Python identifier derived from a server or tool name;
//! collisions within one scope are resolved by numeric suffixing, so the
//! in-sandbox symbols (`mcp_<alias>`, `mcp.servers.<alias>.<tool_alias>`) are
//! stable and unambiguous for a given catalog.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerName(Box<str>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerNameError {
    #[error("server name must not be empty")]
    Empty,
    #[error("invalid server name: {0} (allowed: [A-Za-z0-9_-]+)")]
    Invalid(String),
}

impl ServerName {
    pub fn parse(name: impl AsRef<str>) -> Result<Self, ServerNameError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(ServerNameError::Empty);
        }
        if !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
        {
            return Err(ServerNameError::Invalid(name.to_string()));
        }
        Ok(Self(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ServerName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for ServerName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for ServerName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for ServerName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl TryFrom<&str> for ServerName {
    type Error = ServerNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

// Python 3 keywords; an alias landing on one gets a trailing underscore.
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Converts an arbitrary string into a valid lowercase Python identifier.
pub fn sanitize_identifier(value: &str, default: &str) -> String {
    let mut cleaned = String::with_capacity(value.len());
    let mut last_was_underscore = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            cleaned.push(ch.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            cleaned.push('_');
            last_was_underscore = true;
        }
    }
    let cleaned = cleaned.trim_matches('_');
    let mut cleaned = if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned.to_string()
    };
    if cleaned.starts_with(|ch: char| ch.is_ascii_digit()) {
        cleaned.insert(0, '_');
    }
    if PYTHON_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(&cleaned))
    {
        cleaned.push('_');
    }
    cleaned
}

/// Hands out unique aliases within one scope (the servers of a catalog, or
/// the tools of one server).
#[derive(Debug, Default)]
pub struct AliasAllocator {
    used: BTreeSet<String>,
}

impl AliasAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, raw: &str, default: &str) -> String {
        let base = sanitize_identifier(raw, default);
        let mut alias = base.clone();
        let mut suffix = 1u32;
        while self.used.contains(&alias) {
            suffix += 1;
            alias = format!("{base}_{suffix}");
        }
        self.used.insert(alias.clone());
        alias
    }
}
