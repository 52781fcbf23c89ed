//! Vault file operations: read one file, list both trees.
//!
//! All paths go through [`crate::vault`] first; mode policy is enforced
//! here (the private vault is only reachable in LOCAL mode).

use std::path::Path;

use tracing::debug;

use crate::config::Mode;
use crate::error::GatekeeperError;
use crate::vault::{self, VaultPrefix, VaultRoots};

/// Contents of a single vault file.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Canonical `<prefix>/<remainder>` form of the requested path.
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry in a vault listing. Directory names carry a trailing `/`.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Listing of everything visible under the current mode.
#[derive(Debug, Clone)]
pub struct ListResult {
    pub mode: Mode,
    pub files: Vec<FileEntry>,
}

/// Read a vault file as UTF-8 text.
pub async fn read_file(
    raw_path: &str,
    roots: &VaultRoots,
    mode: Mode,
) -> Result<ReadResult, GatekeeperError> {
    let resolved = vault::resolve_vault_path(raw_path, roots)?;

    if mode == Mode::Cloud && resolved.prefix == VaultPrefix::Private {
        return Err(GatekeeperError::Forbidden {
            message: "private vault access denied in CLOUD mode".into(),
        });
    }

    vault::check_symlink_escape(&resolved).await?;

    let meta = tokio::fs::metadata(&resolved.absolute_path)
        .await
        .map_err(|_| GatekeeperError::NotFound {
            message: "file not found".into(),
        })?;
    if !meta.is_file() {
        return Err(GatekeeperError::NotFound {
            message: "file not found".into(),
        });
    }

    let content = tokio::fs::read_to_string(&resolved.absolute_path)
        .await
        .map_err(|e| GatekeeperError::Io {
            context: format!("reading {}", resolved.relative_path),
            source: e,
        })?;

    debug!(path = %resolved.relative_path, size = meta.len(), "vault read");
    Ok(ReadResult {
        path: resolved.relative_path,
        content,
        size: meta.len(),
    })
}

/// List both vault trees. The private vault is included only in LOCAL mode;
/// in CLOUD mode it is silently omitted rather than erroring.
pub async fn list_files(roots: &VaultRoots, mode: Mode) -> Result<ListResult, GatekeeperError> {
    let mut files = Vec::new();
    walk(roots.root(VaultPrefix::Public), "public", &mut files).await;
    if mode == Mode::Local {
        walk(roots.root(VaultPrefix::Private), "private", &mut files).await;
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ListResult { mode, files })
}

/// Recursively collect entries under `dir`, prefixing names with `prefix`.
/// Unreadable directories are skipped, not fatal.
async fn walk(dir: &Path, prefix: &str, out: &mut Vec<FileEntry>) {
    let mut pending = vec![(dir.to_path_buf(), prefix.to_string())];
    while let Some((dir, prefix)) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            debug!(dir = %dir.display(), "skipping unreadable directory");
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let full = format!("{prefix}/{name}");
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                out.push(FileEntry {
                    name: format!("{full}/"),
                    kind: EntryKind::Directory,
                    size: 0,
                });
                pending.push((entry.path(), full));
            } else {
                out.push(FileEntry {
                    name: full,
                    kind: EntryKind::File,
                    size: meta.len(),
                });
            }
        }
    }
}
