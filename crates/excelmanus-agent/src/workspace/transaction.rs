//! Transactional staging overlay.
//!
//! Thin façade binding a transaction id and a scope to one
//! [`FileVersionManager`]. Every write-path tool call goes through
//! [`WorkspaceTransaction::stage_for_write`]; every read-path call goes
//! through [`WorkspaceTransaction::resolve_read`] which returns the
//! staged path when one exists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::paths::resolve_in_workspace;
use super::versions::{FileVersionManager, StagingScope};
use super::WorkspaceError;

#[derive(Clone)]
pub struct WorkspaceTransaction {
    workspace_root: PathBuf,
    staging_dir: PathBuf,
    tx_id: String,
    scope: StagingScope,
    fvm: Arc<Mutex<FileVersionManager>>,
}

impl WorkspaceTransaction {
    pub fn new(
        workspace_root: PathBuf,
        staging_dir: PathBuf,
        tx_id: String,
        scope: StagingScope,
        fvm: Arc<Mutex<FileVersionManager>>,
    ) -> Result<Self, WorkspaceError> {
        std::fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            workspace_root,
            staging_dir,
            tx_id,
            scope,
            fvm,
        })
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    pub fn scope(&self) -> StagingScope {
        self.scope
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn fvm(&self) -> &Arc<Mutex<FileVersionManager>> {
        &self.fvm
    }

    /// Ensure `file_path` has a staged working copy and return it.
    pub fn stage_for_write(&self, file_path: &str) -> Result<PathBuf, WorkspaceError> {
        self.fvm
            .lock()
            .stage_for_write(file_path, &self.tx_id, self.scope)
    }

    /// Staged path when one exists, otherwise the validated original.
    pub fn resolve_read(&self, file_path: &str) -> Result<PathBuf, WorkspaceError> {
        let resolved = resolve_in_workspace(file_path, &self.workspace_root)?;
        let fvm = self.fvm.lock();
        match fvm.get_staged_path(file_path)? {
            Some(staged) => Ok(staged),
            None => Ok(resolved),
        }
    }

    /// Copy every staged file back to its original location.
    pub fn commit_all(&self) -> Result<Vec<(PathBuf, PathBuf)>, WorkspaceError> {
        self.fvm.lock().commit_all_staged()
    }

    pub fn commit_one(
        &self,
        file_path: &str,
    ) -> Result<Option<(PathBuf, PathBuf)>, WorkspaceError> {
        self.fvm.lock().commit_staged(file_path)
    }

    pub fn rollback_one(&self, file_path: &str) -> Result<bool, WorkspaceError> {
        self.fvm.lock().discard_staged(file_path)
    }

    pub fn rollback_all(&self) -> Result<usize, WorkspaceError> {
        self.fvm.lock().discard_all_staged()
    }

    pub fn cleanup_stale(&self) -> usize {
        self.fvm.lock().prune_stale_staging()
    }

    pub fn list_staged(&self) -> Vec<(PathBuf, PathBuf)> {
        self.fvm.lock().list_staged()
    }

    /// `original_abs → staged_abs`; exported to sandbox subprocesses.
    pub fn staged_file_map(&self) -> HashMap<String, String> {
        self.fvm.lock().staged_file_map()
    }

    /// Merge subprocess-level CoW mappings into this transaction.
    pub fn register_cow_mappings(&self, mapping: &HashMap<String, String>) {
        if mapping.is_empty() {
            return;
        }
        let mut fvm = self.fvm.lock();
        for (src_rel, dst_rel) in mapping {
            if let Err(err) = fvm.register_cow_mapping(src_rel, dst_rel) {
                log::warn!("failed to register CoW mapping {} -> {}: {}", src_rel, dst_rel, err);
            }
        }
    }

    pub fn lookup_cow_redirect(&self, rel_path: &str) -> Option<PathBuf> {
        self.fvm.lock().lookup_cow_redirect(rel_path)
    }

    /// Absolute path → `./relative` form for display; paths outside the
    /// workspace come back unchanged.
    pub fn to_relative(&self, abs_path: &str) -> String {
        match Path::new(abs_path).strip_prefix(&self.workspace_root) {
            Ok(rel) => format!("./{}", rel.to_string_lossy()),
            Err(_) => abs_path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, WorkspaceTransaction) {
        let dir = TempDir::new().unwrap();
        let fvm = Arc::new(Mutex::new(FileVersionManager::new(dir.path()).unwrap()));
        let tx = WorkspaceTransaction::new(
            dir.path().to_path_buf(),
            dir.path().join("outputs/backups"),
            "tx-test".to_string(),
            StagingScope::All,
            fvm,
        )
        .unwrap();
        (dir, tx)
    }

    #[test]
    fn resolve_read_prefers_staged_path() {
        let (dir, tx) = setup();
        let original = dir.path().join("report.csv");
        fs::write(&original, "data").unwrap();

        assert_eq!(tx.resolve_read("report.csv").unwrap(), original);
        let staged = tx.stage_for_write("report.csv").unwrap();
        assert_eq!(tx.resolve_read("report.csv").unwrap(), staged);
    }

    #[test]
    fn commit_all_clears_staging() {
        let (dir, tx) = setup();
        fs::write(dir.path().join("report.csv"), "old").unwrap();
        let staged = tx.stage_for_write("report.csv").unwrap();
        fs::write(&staged, "new").unwrap();

        let committed = tx.commit_all().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("report.csv")).unwrap(),
            "new"
        );
        assert!(tx.list_staged().is_empty());
    }

    #[test]
    fn rollback_all_discards_staged_files() {
        let (dir, tx) = setup();
        fs::write(dir.path().join("report.csv"), "old").unwrap();
        let staged = tx.stage_for_write("report.csv").unwrap();
        fs::write(&staged, "new").unwrap();

        assert_eq!(tx.rollback_all().unwrap(), 1);
        assert!(!staged.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("report.csv")).unwrap(),
            "old"
        );
    }

    #[test]
    fn cow_mappings_become_redirects() {
        let (dir, tx) = setup();
        fs::write(dir.path().join("data.csv"), "protected").unwrap();
        fs::create_dir_all(dir.path().join("outputs/backups")).unwrap();
        fs::write(dir.path().join("outputs/backups/data.csv"), "copy").unwrap();

        let mut mapping = HashMap::new();
        mapping.insert(
            "data.csv".to_string(),
            "outputs/backups/data.csv".to_string(),
        );
        tx.register_cow_mappings(&mapping);

        let redirect = tx.lookup_cow_redirect("data.csv").unwrap();
        assert!(redirect.ends_with("outputs/backups/data.csv"));
        // the next read resolves through the redirect
        assert_eq!(tx.resolve_read("data.csv").unwrap(), redirect);
    }

    #[test]
    fn to_relative_formats_workspace_paths() {
        let (dir, tx) = setup();
        let inside = dir.path().join("outputs/a.csv");
        assert_eq!(tx.to_relative(&inside.to_string_lossy()), "./outputs/a.csv");
        assert_eq!(tx.to_relative("/etc/passwd"), "/etc/passwd");
    }
}
