use std::collections::BTreeMap;

use super::load::{merge_file_for_test, parse_entry_for_test};
use super::*;

#[test]
fn parse_entry_requires_a_command() {
    assert!(parse_entry_for_test("files", serde_json::json!({})).is_none());
    assert!(parse_entry_for_test("files", serde_json::json!({ "command": "  " })).is_none());

    let record = parse_entry_for_test(
        "files",
        serde_json::json!({
            "command": "mcp-files",
            "args": ["--root", "/data"],
            "env": { "LOG": "debug" },
            "cwd": "/srv/files",
        }),
    )
    .unwrap();
    assert_eq!(record.command, "mcp-files");
    assert_eq!(record.args, vec!["--root", "/data"]);
    assert_eq!(record.env.get("LOG").map(String::as_str), Some("debug"));
    assert_eq!(record.cwd.as_deref(), Some(std::path::Path::new("/srv/files")));
}

#[test]
fn parse_entry_rejects_invalid_names() {
    assert!(parse_entry_for_test("bad name", serde_json::json!({ "command": "x" })).is_none());
    assert!(parse_entry_for_test("", serde_json::json!({ "command": "x" })).is_none());
}

#[test]
fn parse_entry_ignores_unknown_fields() {
    let record = parse_entry_for_test(
        "stub",
        serde_json::json!({
            "command": "stub-server",
            "description": "not part of the record",
            "enabled": true,
        }),
    )
    .unwrap();
    assert_eq!(record.command, "stub-server");
    assert!(record.args.is_empty());
}

#[tokio::test]
async fn later_files_win_on_name_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.json");
    let second = dir.path().join("second.json");
    tokio::fs::write(
        &first,
        r#"{ "mcpServers": { "stub": { "command": "old-stub" } } }"#,
    )
    .await
    .unwrap();
    tokio::fs::write(
        &second,
        r#"{ "mcpServers": { "stub": { "command": "new-stub" }, "extra": { "command": "extra" } } }"#,
    )
    .await
    .unwrap();

    let mut servers = BTreeMap::new();
    merge_file_for_test(&mut servers, &first).await;
    merge_file_for_test(&mut servers, &second).await;

    assert_eq!(servers.len(), 2);
    assert_eq!(servers.get("stub").unwrap().command, "new-stub");
    assert_eq!(servers.get("extra").unwrap().command, "extra");
}

#[tokio::test]
async fn malformed_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    tokio::fs::write(&path, "{ not json").await.unwrap();

    let mut servers = BTreeMap::new();
    merge_file_for_test(&mut servers, &path).await;
    assert!(servers.is_empty());
}

#[tokio::test]
async fn missing_files_are_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut servers = BTreeMap::new();
    merge_file_for_test(&mut servers, &dir.path().join("absent.json")).await;
    assert!(servers.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_configs_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("real.json");
    tokio::fs::write(
        &target,
        r#"{ "mcpServers": { "stub": { "command": "stub" } } }"#,
    )
    .await
    .unwrap();
    let link = dir.path().join("link.json");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let mut servers = BTreeMap::new();
    merge_file_for_test(&mut servers, &link).await;
    assert!(servers.is_empty(), "symlinked config must be skipped");
}

#[test]
fn catalog_orders_names_deterministically() {
    let mut servers = BTreeMap::new();
    for name in ["zeta", "alpha", "mid"] {
        let record = parse_entry_for_test(name, serde_json::json!({ "command": "x" })).unwrap();
        servers.insert(record.name.clone(), record);
    }
    let catalog = Catalog::new(servers);
    let names: Vec<_> = catalog.names().map(|n| n.as_str()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}
