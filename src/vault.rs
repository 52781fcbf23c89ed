//! Vault path resolution and traversal defense.
//!
//! Untrusted path strings like `public/notes/readme.txt` are mapped to
//! absolute paths inside one of the two vault roots. Traversal is rejected
//! by lexical containment of the final resolved path — decoding and
//! normalization happen first, so encoded, double-encoded, and backslash
//! variants all funnel through the same containment check.

use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::GatekeeperError;

/// Which of the two vault trees a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultPrefix {
    Public,
    Private,
}

impl VaultPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            VaultPrefix::Public => "public",
            VaultPrefix::Private => "private",
        }
    }
}

/// The two configured vault roots, absolute.
#[derive(Debug, Clone)]
pub struct VaultRoots {
    pub public: PathBuf,
    pub private: PathBuf,
}

impl VaultRoots {
    pub fn root(&self, prefix: VaultPrefix) -> &Path {
        match prefix {
            VaultPrefix::Public => &self.public,
            VaultPrefix::Private => &self.private,
        }
    }
}

/// A validated, vault-contained path. Ephemeral — recomputed per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub prefix: VaultPrefix,
    pub vault_root: PathBuf,
    pub absolute_path: PathBuf,
    /// Canonical display form: `<prefix>/<remainder>`.
    pub relative_path: String,
}

/// Parse a vault-prefixed path like `public/readme.txt` into a resolved
/// absolute path within the matching vault root, or reject it.
pub fn resolve_vault_path(
    raw_path: &str,
    roots: &VaultRoots,
) -> Result<ResolvedPath, GatekeeperError> {
    // NUL bytes before decoding
    if raw_path.contains('\0') {
        return Err(GatekeeperError::Traversal);
    }

    // Decode URL encoding before any path operations
    let decoded = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| GatekeeperError::Traversal)?;

    // NUL bytes smuggled through encoding
    if decoded.contains('\0') {
        return Err(GatekeeperError::Traversal);
    }

    // Backslashes (platform-alternate separator used as a traversal vector)
    if decoded.contains('\\') {
        return Err(GatekeeperError::Traversal);
    }

    let (prefix, remainder) = if let Some(rest) = decoded.strip_prefix("public/") {
        (VaultPrefix::Public, rest)
    } else if let Some(rest) = decoded.strip_prefix("private/") {
        (VaultPrefix::Private, rest)
    } else {
        return Err(GatekeeperError::Validation {
            message: "must start with public/ or private/".into(),
        });
    };

    if remainder.is_empty() || remainder == "/" {
        return Err(GatekeeperError::Validation {
            message: "must start with public/ or private/".into(),
        });
    }

    let vault_root = roots.root(prefix).to_path_buf();
    let absolute_path = lexical_resolve(&vault_root, remainder);

    // Containment: the resolved path must be the root itself or sit strictly
    // below it. This is what defeats `../../etc/passwd`-style escapes after
    // decoding has collapsed them.
    if !absolute_path.starts_with(&vault_root) {
        return Err(GatekeeperError::Traversal);
    }

    Ok(ResolvedPath {
        prefix,
        vault_root,
        absolute_path,
        relative_path: format!("{}/{}", prefix.as_str(), remainder),
    })
}

/// Resolve `relative` against `root` lexically, collapsing `.` and `..`
/// without touching the filesystem. A leading `/` makes the remainder
/// absolute, which the containment check then rejects.
fn lexical_resolve(root: &Path, relative: &str) -> PathBuf {
    let mut out = if relative.starts_with('/') {
        PathBuf::from("/")
    } else {
        root.to_path_buf()
    };
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Reject resolved paths that are symlinks pointing outside the vault.
///
/// Distinct from [`resolve_vault_path`] because it needs a stat syscall.
/// A nonexistent path is a no-op — the caller's existence check surfaces
/// the not-found case, so this never reports a false "file not found."
pub async fn check_symlink_escape(resolved: &ResolvedPath) -> Result<(), GatekeeperError> {
    let Ok(meta) = tokio::fs::symlink_metadata(&resolved.absolute_path).await else {
        return Ok(());
    };
    if !meta.file_type().is_symlink() {
        return Ok(());
    }
    // Dangling symlink: canonicalize fails, caller's existence check handles it
    let Ok(real) = tokio::fs::canonicalize(&resolved.absolute_path).await else {
        return Ok(());
    };
    let root = tokio::fs::canonicalize(&resolved.vault_root)
        .await
        .unwrap_or_else(|_| resolved.vault_root.clone());
    if !real.starts_with(&root) {
        return Err(GatekeeperError::Traversal);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> VaultRoots {
        VaultRoots {
            public: PathBuf::from("/srv/vaults/public"),
            private: PathBuf::from("/srv/vaults/private"),
        }
    }

    fn assert_traversal(raw: &str) {
        match resolve_vault_path(raw, &roots()) {
            Err(GatekeeperError::Traversal) => {}
            other => panic!("expected traversal rejection for {raw:?}, got {other:?}"),
        }
    }

    // ── Acceptance ──────────────────────────────────────────────────

    #[test]
    fn resolves_simple_public_path() {
        let r = resolve_vault_path("public/readme.txt", &roots()).unwrap();
        assert_eq!(r.prefix, VaultPrefix::Public);
        assert_eq!(r.absolute_path, Path::new("/srv/vaults/public/readme.txt"));
        assert_eq!(r.relative_path, "public/readme.txt");
    }

    #[test]
    fn resolves_nested_private_path() {
        let r = resolve_vault_path("private/a/b/c.txt", &roots()).unwrap();
        assert_eq!(r.prefix, VaultPrefix::Private);
        assert_eq!(
            r.absolute_path,
            Path::new("/srv/vaults/private/a/b/c.txt")
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let a = resolve_vault_path("public/docs/guide.md", &roots()).unwrap();
        let b = resolve_vault_path("public/docs/guide.md", &roots()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dotdot_within_vault_is_allowed() {
        let r = resolve_vault_path("public/a/../readme.txt", &roots()).unwrap();
        assert_eq!(r.absolute_path, Path::new("/srv/vaults/public/readme.txt"));
    }

    #[test]
    fn percent_encoded_valid_path_decodes() {
        let r = resolve_vault_path("public/hello%20world.txt", &roots()).unwrap();
        assert_eq!(
            r.absolute_path,
            Path::new("/srv/vaults/public/hello world.txt")
        );
    }

    // ── Traversal rejections ────────────────────────────────────────

    #[test]
    fn rejects_plain_dotdot_traversal() {
        assert_traversal("public/../../etc/passwd");
    }

    #[test]
    fn rejects_encoded_traversal() {
        assert_traversal("public/%2e%2e%2f%2e%2e%2fetc/passwd");
    }

    #[test]
    fn rejects_nul_byte() {
        assert_traversal("public/readme.txt\0.jpg");
    }

    #[test]
    fn rejects_encoded_nul_byte() {
        assert_traversal("public/readme.txt%00.jpg");
    }

    #[test]
    fn rejects_backslash_variant() {
        assert_traversal("public/..\\..\\etc\\passwd");
    }

    #[test]
    fn rejects_encoded_backslash_variant() {
        assert_traversal("public/..%5c..%5cetc%5cpasswd");
    }

    #[test]
    fn rejects_escape_to_sibling_vault() {
        assert_traversal("public/../private/secrets.txt");
    }

    #[test]
    fn rejects_embedded_absolute_path() {
        assert_traversal("public//etc/passwd");
    }

    // ── Prefix rejections ───────────────────────────────────────────

    #[test]
    fn rejects_missing_prefix() {
        let err = resolve_vault_path("/etc/passwd", &roots()).unwrap_err();
        assert!(err.to_string().contains("must start with public/ or private/"));
    }

    #[test]
    fn rejects_bare_prefix() {
        assert!(resolve_vault_path("public/", &roots()).is_err());
        assert!(resolve_vault_path("public", &roots()).is_err());
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(resolve_vault_path("shared/readme.txt", &roots()).is_err());
    }

    #[test]
    fn prefix_match_is_exact_not_fuzzy() {
        // "publicx/..." must not be treated as the public vault
        assert!(resolve_vault_path("publicx/readme.txt", &roots()).is_err());
    }

    // ── Symlink escape (filesystem-touching) ────────────────────────

    #[tokio::test]
    async fn symlink_escaping_vault_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        std::fs::create_dir_all(&public).unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, "escaped!").unwrap();
        std::os::unix::fs::symlink(&outside, public.join("escape_link.txt")).unwrap();

        let roots = VaultRoots {
            public: public.clone(),
            private: dir.path().join("private"),
        };
        let resolved = resolve_vault_path("public/escape_link.txt", &roots).unwrap();
        match check_symlink_escape(&resolved).await {
            Err(GatekeeperError::Traversal) => {}
            other => panic!("expected traversal rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn symlink_within_vault_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        std::fs::create_dir_all(&public).unwrap();
        std::fs::write(public.join("target.txt"), "fine").unwrap();
        std::os::unix::fs::symlink(public.join("target.txt"), public.join("link.txt")).unwrap();

        let roots = VaultRoots {
            public: public.clone(),
            private: dir.path().join("private"),
        };
        let resolved = resolve_vault_path("public/link.txt", &roots).unwrap();
        assert!(check_symlink_escape(&resolved).await.is_ok());
    }

    #[tokio::test]
    async fn nonexistent_path_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        std::fs::create_dir_all(&public).unwrap();
        let roots = VaultRoots {
            public,
            private: dir.path().join("private"),
        };
        let resolved = resolve_vault_path("public/missing.txt", &roots).unwrap();
        assert!(check_symlink_escape(&resolved).await.is_ok());
    }
}
