//! Workspace-scoped path resolution.
//!
//! Single entry point for the "path is inside the workspace" check that
//! the version manager, transactions, registry and tool handlers all
//! share. The normalization is lexical (no symlink following is
//! required for the check itself) so it also works for paths that do
//! not exist yet.

use std::path::{Component, Path, PathBuf};

use super::WorkspaceError;

/// Resolve `file_path` against `workspace_root` and verify it stays
/// inside the root. Accepts both relative and absolute inputs.
pub fn resolve_in_workspace(
    file_path: &str,
    workspace_root: &Path,
) -> Result<PathBuf, WorkspaceError> {
    let raw = Path::new(file_path);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        workspace_root.join(raw)
    };

    let normalized = normalize(&joined);
    if !normalized.starts_with(workspace_root) {
        return Err(WorkspaceError::OutsideWorkspace {
            path: file_path.to_string(),
        });
    }
    Ok(normalized)
}

/// Absolute path → workspace-relative string (forward slashes).
pub fn to_workspace_relative(abs_path: &Path, workspace_root: &Path) -> String {
    match abs_path.strip_prefix(workspace_root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => abs_path.to_string_lossy().to_string(),
    }
}

/// Lexically normalize a path: drop `.` segments, fold `..` against the
/// preceding component, and strip any `..` that would climb past the
/// filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // climbing past the root; keep popping silently so
                    // the starts_with check below rejects the path
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/excelmanus/users/u1")
    }

    #[test]
    fn relative_path_resolves_inside_root() {
        let resolved = resolve_in_workspace("uploads/report.xlsx", &root()).unwrap();
        assert_eq!(
            resolved,
            PathBuf::from("/srv/excelmanus/users/u1/uploads/report.xlsx")
        );
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let resolved =
            resolve_in_workspace("/srv/excelmanus/users/u1/outputs/out.csv", &root()).unwrap();
        assert!(resolved.starts_with(root()));
    }

    #[test]
    fn etc_passwd_is_rejected() {
        let err = resolve_in_workspace("/etc/passwd", &root()).unwrap_err();
        assert!(matches!(err, WorkspaceError::OutsideWorkspace { .. }));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let err = resolve_in_workspace("../../other_user/secret.xlsx", &root()).unwrap_err();
        assert!(matches!(err, WorkspaceError::OutsideWorkspace { .. }));
    }

    #[test]
    fn dotdot_inside_root_is_normalized() {
        let resolved = resolve_in_workspace("uploads/../outputs/a.csv", &root()).unwrap();
        assert_eq!(
            resolved,
            PathBuf::from("/srv/excelmanus/users/u1/outputs/a.csv")
        );
    }

    #[test]
    fn to_relative_uses_forward_slashes() {
        let rel = to_workspace_relative(
            Path::new("/srv/excelmanus/users/u1/outputs/backups/a.xlsx"),
            &root(),
        );
        assert_eq!(rel, "outputs/backups/a.xlsx");
    }

    #[test]
    fn to_relative_outside_root_returns_input() {
        let rel = to_workspace_relative(Path::new("/etc/passwd"), &root());
        assert_eq!(rel, "/etc/passwd");
    }
}
