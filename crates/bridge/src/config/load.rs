use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::file_format::{ConfigFile, ServerEntry};
use super::{Catalog, ServerRecord, MAX_CONFIG_BYTES};
use crate::naming::ServerName;
use crate::settings::Settings;

/// Scans the default locations (plus the settings override) and assembles the
/// catalog. Unreadable or malformed files are logged and skipped; a broken
/// config must never take the bridge down.
pub async fn load_catalog(settings: &Settings) -> anyhow::Result<Catalog> {
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let home = std::env::var_os("HOME").map(PathBuf::from);

    let mut servers = BTreeMap::new();

    for path in super::default_config_paths(home.as_deref(), &cwd) {
        merge_config_file(&mut servers, &path).await;
    }
    for dir in super::default_config_dirs(home.as_deref(), &cwd) {
        merge_config_dir(&mut servers, &dir).await;
    }
    if let Some(path) = &settings.config_path {
        merge_config_file(&mut servers, path).await;
    }

    tracing::info!(count = servers.len(), "discovered mcp servers");
    Ok(Catalog::new(servers))
}

async fn merge_config_dir(servers: &mut BTreeMap<ServerName, ServerRecord>, dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), %err, "failed to read config directory");
            return;
        }
    };

    let mut paths = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    // Deterministic precedence within a directory.
    paths.sort();
    for path in paths {
        merge_config_file(servers, &path).await;
    }
}

async fn merge_config_file(servers: &mut BTreeMap<ServerName, ServerRecord>, path: &Path) {
    let contents = match try_read_limited(path).await {
        Ok(Some(contents)) => contents,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(path = %path.display(), err = format!("{err:#}"), "skipping config file");
            return;
        }
    };

    let parsed: ConfigFile = match serde_json::from_str(&contents) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "skipping malformed config file");
            return;
        }
    };

    for (name, entry) in parsed.mcp_servers {
        match parse_server_entry(&name, entry) {
            Some(record) => {
                tracing::info!(server = %record.name, path = %path.display(), "found mcp server");
                servers.insert(record.name.clone(), record);
            }
            None => {
                tracing::warn!(server = %name, path = %path.display(), "skipping server entry");
            }
        }
    }
}

fn parse_server_entry(name: &str, entry: ServerEntry) -> Option<ServerRecord> {
    let name = ServerName::parse(name).ok()?;
    let command = entry.command.filter(|cmd| !cmd.trim().is_empty())?;
    Some(ServerRecord {
        name,
        command,
        args: entry.args,
        env: entry.env,
        cwd: entry.cwd,
    })
}

/// Bounded, symlink-refusing config read. Returns `Ok(None)` when the file
/// does not exist.
async fn try_read_limited(path: &Path) -> anyhow::Result<Option<String>> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };
    if !meta.file_type().is_file() {
        anyhow::bail!("config must be a regular file: {}", path.display());
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        options.custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK);
    }

    use tokio::io::AsyncReadExt;

    let file = match options.open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let file_meta = file
        .metadata()
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if !file_meta.file_type().is_file() {
        anyhow::bail!("config must be a regular file: {}", path.display());
    }
    if file_meta.len() > MAX_CONFIG_BYTES {
        anyhow::bail!(
            "config too large: {} bytes (max {}): {}",
            file_meta.len(),
            MAX_CONFIG_BYTES,
            path.display()
        );
    }

    let mut buf = Vec::new();
    file.take(MAX_CONFIG_BYTES + 1)
        .read_to_end(&mut buf)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    if buf.len() as u64 > MAX_CONFIG_BYTES {
        anyhow::bail!("config too large: {}", path.display());
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| anyhow::anyhow!("config is not valid UTF-8: {}: {err}", path.display()))
}

/// Test seam: merge one file's records into a map, same path the scanner uses.
#[cfg(test)]
pub(super) async fn merge_file_for_test(
    servers: &mut BTreeMap<ServerName, ServerRecord>,
    path: &Path,
) {
    merge_config_file(servers, path).await;
}

#[cfg(test)]
pub(super) fn parse_entry_for_test(name: &str, raw: serde_json::Value) -> Option<ServerRecord> {
    let entry: ServerEntry = serde_json::from_value(raw).ok()?;
    parse_server_entry(name, entry)
}
