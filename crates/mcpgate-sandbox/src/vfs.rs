//! Virtual filesystem browsing
//!
//! `fs_browse` exposes `list`, `read`, and `stat` over a session root. Every
//! path is resolved lexically and confined to the root; any traversal that
//! would escape is rejected before touching the filesystem.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};

use mcpgate_core::{GatewayError, GatewayResult};

/// A browse request.
#[derive(Debug, Deserialize)]
pub struct BrowseArgs {
    /// Path relative to the session root
    #[serde(default)]
    pub path: String,
    /// `list`, `read`, or `stat`
    pub op: BrowseOp,
}

/// Supported browse operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowseOp {
    /// Directory listing
    List,
    /// File contents
    Read,
    /// Size and kind
    Stat,
}

/// Resolve a browse path inside `root`, rejecting traversal.
pub fn confine(root: &Path, relative: &str) -> GatewayResult<PathBuf> {
    let candidate = Path::new(relative.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GatewayError::forbidden(format!(
                    "path '{relative}' escapes the session root"
                )));
            }
        }
    }
    Ok(resolved)
}

/// Execute a browse operation confined to `root`.
pub async fn browse(root: &Path, args: BrowseArgs) -> GatewayResult<Value> {
    let target = confine(root, &args.path)?;
    match args.op {
        BrowseOp::List => {
            let mut reader = tokio::fs::read_dir(&target)
                .await
                .map_err(|e| browse_error(&args.path, &e))?;
            let mut entries = Vec::new();
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| browse_error(&args.path, &e))?
            {
                let meta = entry.metadata().await.map_err(|e| browse_error(&args.path, &e))?;
                entries.push(json!({
                    "name": entry.file_name().to_string_lossy(),
                    "kind": if meta.is_dir() { "dir" } else { "file" },
                    "size": meta.len(),
                }));
            }
            entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
            Ok(json!({"entries": entries}))
        }
        BrowseOp::Read => {
            let content = tokio::fs::read_to_string(&target)
                .await
                .map_err(|e| browse_error(&args.path, &e))?;
            Ok(json!({"path": args.path, "content": content}))
        }
        BrowseOp::Stat => {
            let meta = tokio::fs::metadata(&target)
                .await
                .map_err(|e| browse_error(&args.path, &e))?;
            Ok(json!({
                "path": args.path,
                "kind": if meta.is_dir() { "dir" } else { "file" },
                "size": meta.len(),
            }))
        }
    }
}

fn browse_error(path: &str, err: &std::io::Error) -> GatewayError {
    if err.kind() == std::io::ErrorKind::NotFound {
        GatewayError::not_found(format!("path '{path}'"))
    } else {
        GatewayError::internal(format!("fs_browse '{path}': {err}"))
    }
}
