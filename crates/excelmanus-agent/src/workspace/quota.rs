//! Per-workspace storage quotas.

use std::path::Path;

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_SIZE_MB: u64 = 200;
const DEFAULT_MAX_FILES: usize = 1000;
const ADMIN_DEFAULT_MAX_SIZE_MB: u64 = 1024;

/// Directories whose contents never count against the user quota.
const SYSTEM_DIR_PREFIXES: &[&str] = &[
    "outputs/backups",
    "outputs/approvals",
    "outputs/.versions",
    "scripts",
];

/// System files excluded from the quota (the registry database and its
/// WAL siblings).
const SYSTEM_FILE_NAMES: &[&str] = &["data.db", "data.db-shm", "data.db-wal"];

/// Storage ceilings for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_SIZE_MB * 1024 * 1024,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl QuotaPolicy {
    pub fn from_env() -> Self {
        let max_mb = env_u64("EXCELMANUS_WORKSPACE_MAX_SIZE_MB", DEFAULT_MAX_SIZE_MB);
        let max_files = env_u64("EXCELMANUS_WORKSPACE_MAX_FILES", DEFAULT_MAX_FILES as u64);
        Self {
            max_bytes: max_mb * 1024 * 1024,
            max_files: max_files as usize,
        }
    }

    /// Per-user quota: explicit values win, zero/missing falls back to
    /// role defaults (admins get 1 GiB, everyone else the env default).
    pub fn for_user(max_storage_mb: u64, max_files: usize, is_admin: bool) -> Self {
        let env = Self::from_env();
        let max_bytes = if max_storage_mb > 0 {
            max_storage_mb * 1024 * 1024
        } else if is_admin {
            ADMIN_DEFAULT_MAX_SIZE_MB * 1024 * 1024
        } else {
            env.max_bytes
        };
        Self {
            max_bytes,
            max_files: if max_files > 0 { max_files } else { env.max_files },
        }
    }

    pub fn max_size_mb(&self) -> f64 {
        self.max_bytes as f64 / (1024.0 * 1024.0)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// One user-visible file found by [`scan_usage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageFile {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified_at: i64,
}

/// Current storage occupancy of one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceUsage {
    pub total_bytes: u64,
    pub file_count: usize,
    pub max_bytes: u64,
    pub max_files: usize,
    pub files: Vec<UsageFile>,
}

impl WorkspaceUsage {
    pub fn over_size(&self) -> bool {
        self.total_bytes > self.max_bytes
    }

    pub fn over_files(&self) -> bool {
        self.file_count > self.max_files
    }
}

pub(crate) fn is_system_file(rel: &Path) -> bool {
    if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
        if SYSTEM_FILE_NAMES.contains(&name) {
            return true;
        }
    }
    let rel_str = rel.to_string_lossy().replace('\\', "/");
    SYSTEM_DIR_PREFIXES
        .iter()
        .any(|prefix| rel_str == *prefix || rel_str.starts_with(&format!("{}/", prefix)))
}

/// Walk a workspace and return user-visible files sorted by mtime
/// (oldest first). Hidden directories and system files are skipped:
/// only files the user actually created or uploaded count.
pub fn scan_usage(workspace_dir: &Path) -> Vec<UsageFile> {
    let mut results = Vec::new();
    if !workspace_dir.is_dir() {
        return results;
    }

    let walker = ignore::WalkBuilder::new(workspace_dir)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    for entry in walker.flatten() {
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel) = path.strip_prefix(workspace_dir) else {
            continue;
        };
        // skip files under hidden directories (.tmp, .avatars, ...)
        let in_hidden_dir = rel
            .parent()
            .map(|p| {
                p.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if in_hidden_dir || is_system_file(rel) {
            continue;
        }
        let Ok(meta) = path.metadata() else { continue };
        let modified_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        results.push(UsageFile {
            path: rel.to_string_lossy().replace('\\', "/"),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            size: meta.len(),
            modified_at,
        });
    }

    results.sort_by_key(|f| f.modified_at);
    results
}

/// Remove now-empty parent directories up to (not including) `root`.
pub(crate) fn cleanup_empty_parents(child: &Path, root: &Path) {
    let mut parent = child.parent();
    while let Some(dir) = parent {
        if dir == root || !dir.is_dir() {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_quota_is_200mb_1000_files() {
        let quota = QuotaPolicy::default();
        assert_eq!(quota.max_bytes, 200 * 1024 * 1024);
        assert_eq!(quota.max_files, 1000);
    }

    #[test]
    fn admin_fallback_is_one_gib() {
        let quota = QuotaPolicy::for_user(0, 0, true);
        assert_eq!(quota.max_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn explicit_user_quota_wins() {
        let quota = QuotaPolicy::for_user(50, 10, true);
        assert_eq!(quota.max_bytes, 50 * 1024 * 1024);
        assert_eq!(quota.max_files, 10);
    }

    #[test]
    fn system_paths_are_recognized() {
        assert!(is_system_file(Path::new("outputs/backups/a.xlsx")));
        assert!(is_system_file(Path::new("outputs/.versions/ab/abc/f.csv")));
        assert!(is_system_file(Path::new("data.db")));
        assert!(is_system_file(Path::new("uploads/data.db-wal")));
        assert!(!is_system_file(Path::new("outputs/report.xlsx")));
        assert!(!is_system_file(Path::new("uploads/a.csv")));
    }

    #[test]
    fn scan_skips_system_and_hidden_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("uploads")).unwrap();
        fs::create_dir_all(dir.path().join("outputs/backups")).unwrap();
        fs::create_dir_all(dir.path().join(".tmp")).unwrap();
        fs::write(dir.path().join("uploads/a.csv"), "1,2").unwrap();
        fs::write(dir.path().join("outputs/backups/a_copy.csv"), "1,2").unwrap();
        fs::write(dir.path().join(".tmp/scratch.txt"), "x").unwrap();
        fs::write(dir.path().join("data.db"), "sqlite").unwrap();

        let files = scan_usage(dir.path());
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["uploads/a.csv"]);
    }
}
