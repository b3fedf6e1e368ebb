//! Every workspace member inherits version and edition from the root
//! manifest, and internal crates are referenced through the workspace table.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(path: &Path) -> toml::Value {
    let raw = std::fs::read_to_string(path.join("Cargo.toml")).unwrap();
    raw.parse().unwrap()
}

fn members() -> Vec<String> {
    manifest(&workspace_root())["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect()
}

fn inherits(package: &toml::Value, key: &str) -> bool {
    package
        .get(key)
        .and_then(|v| v.get("workspace"))
        .and_then(|v| v.as_bool())
        == Some(true)
}

#[test]
fn test_members_inherit_version_and_edition() {
    let members = members();
    assert!(members.iter().any(|m| m.ends_with("convoy-core")));

    for member in &members {
        let doc = manifest(&workspace_root().join(member));
        let package = &doc["package"];
        assert!(inherits(package, "version"), "{member} must use version.workspace = true");
        assert!(inherits(package, "edition"), "{member} must use edition.workspace = true");
    }
}

#[test]
fn test_internal_crates_are_declared_at_the_root() {
    let root = manifest(&workspace_root());
    let shared = root["workspace"]["dependencies"].as_table().unwrap();

    for member in members() {
        let name = member.rsplit('/').next().unwrap().to_string();
        if name == "convoyd" {
            continue;
        }
        let entry = shared
            .get(&name)
            .unwrap_or_else(|| panic!("{name} missing from [workspace.dependencies]"));
        assert_eq!(entry["path"].as_str(), Some(member.as_str()));
        assert_eq!(
            entry["version"].as_str(),
            root["workspace"]["package"]["version"].as_str(),
            "{name} pinned to a different version than the workspace"
        );
    }
}

#[test]
fn test_workspace_version_matches_this_crate() {
    let root = manifest(&workspace_root());
    assert_eq!(
        root["workspace"]["package"]["version"].as_str(),
        Some(env!("CARGO_PKG_VERSION"))
    );
}
