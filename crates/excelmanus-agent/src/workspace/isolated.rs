//! Per-user isolated workspace roots.
//!
//! Each session runs inside an [`IsolatedWorkspace`]: the resolved root
//! directory, sandbox configuration, quota policy, and a factory for
//! per-session [`WorkspaceTransaction`] overlays. Concurrent sessions
//! of different users are isolated by construction: their roots never
//! overlap.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::quota::{cleanup_empty_parents, scan_usage, QuotaPolicy, WorkspaceUsage};
use super::transaction::WorkspaceTransaction;
use super::versions::{FileVersionManager, StagingScope};
use super::WorkspaceError;

/// Sandbox configuration for code execution in this workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxConfig {
    pub docker_enabled: bool,
}

pub struct IsolatedWorkspace {
    root_dir: PathBuf,
    owner_id: Option<String>,
    sandbox_config: SandboxConfig,
    quota: QuotaPolicy,
    transaction_enabled: bool,
    transaction_scope: StagingScope,
    staging_base: PathBuf,
}

impl IsolatedWorkspace {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        Self::with_options(root_dir, None, SandboxConfig::default(), None, true, StagingScope::All)
    }

    pub fn with_options(
        root_dir: impl Into<PathBuf>,
        owner_id: Option<String>,
        sandbox_config: SandboxConfig,
        quota: Option<QuotaPolicy>,
        transaction_enabled: bool,
        transaction_scope: StagingScope,
    ) -> Result<Self, WorkspaceError> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)?;
        let staging_base = root_dir.join("outputs").join("backups");
        Ok(Self {
            root_dir,
            owner_id,
            sandbox_config,
            quota: quota.unwrap_or_else(QuotaPolicy::from_env),
            transaction_enabled,
            transaction_scope,
            staging_base,
        })
    }

    /// Resolve the workspace for a request: per-user root when auth is
    /// enabled and a user id is present, the shared root otherwise.
    pub fn resolve(
        global_workspace_root: &Path,
        user_id: Option<&str>,
        auth_enabled: bool,
        sandbox_config: SandboxConfig,
        transaction_enabled: bool,
        transaction_scope: StagingScope,
    ) -> Result<Self, WorkspaceError> {
        let (root, owner) = match (auth_enabled, user_id) {
            (true, Some(uid)) if !uid.is_empty() => (
                global_workspace_root.join("users").join(uid),
                Some(uid.to_string()),
            ),
            _ => (global_workspace_root.to_path_buf(), None),
        };
        Self::with_options(
            root,
            owner,
            sandbox_config,
            None,
            transaction_enabled,
            transaction_scope,
        )
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        self.sandbox_config
    }

    pub fn quota(&self) -> QuotaPolicy {
        self.quota
    }

    pub fn transaction_enabled(&self) -> bool {
        self.transaction_enabled
    }

    pub fn transaction_scope(&self) -> StagingScope {
        self.transaction_scope
    }

    // ── factories ───────────────────────────────────────────────

    /// New transaction bound to this workspace's staging directory.
    pub fn create_transaction(
        &self,
        fvm: Arc<Mutex<FileVersionManager>>,
        tx_id: Option<String>,
    ) -> Result<WorkspaceTransaction, WorkspaceError> {
        let tx_id = tx_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..16].to_string());
        WorkspaceTransaction::new(
            self.root_dir.clone(),
            self.staging_base.clone(),
            tx_id,
            self.transaction_scope,
            fvm,
        )
    }

    /// Sandbox execution environment bound to a transaction.
    pub fn create_sandbox_env(&self, transaction: Option<WorkspaceTransaction>) -> SandboxEnv {
        SandboxEnv {
            root_dir: self.root_dir.clone(),
            docker_enabled: self.sandbox_config.docker_enabled,
            transaction,
        }
    }

    // ── quota operations ────────────────────────────────────────

    pub fn get_usage(&self) -> WorkspaceUsage {
        let files = scan_usage(&self.root_dir);
        let total_bytes = files.iter().map(|f| f.size).sum();
        WorkspaceUsage {
            total_bytes,
            file_count: files.len(),
            max_bytes: self.quota.max_bytes,
            max_files: self.quota.max_files,
            files,
        }
    }

    /// Delete oldest-mtime files until both limits hold. Returns the
    /// deleted workspace-relative paths.
    pub fn enforce_quota(&self) -> Vec<String> {
        let mut files = scan_usage(&self.root_dir);
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        let mut deleted = Vec::new();

        while !files.is_empty()
            && (files.len() > self.quota.max_files || total > self.quota.max_bytes)
        {
            let oldest = files.remove(0);
            let full_path = self.root_dir.join(&oldest.path);
            match fs::remove_file(&full_path) {
                Ok(()) => {
                    total = total.saturating_sub(oldest.size);
                    log::info!("quota: deleted {} ({} bytes)", oldest.path, oldest.size);
                    cleanup_empty_parents(&full_path, &self.root_dir);
                    deleted.push(oldest.path);
                }
                Err(err) => {
                    log::warn!("quota: failed to delete {}: {}", oldest.path, err);
                }
            }
        }
        deleted
    }

    /// Pre-flight check for uploads of `incoming_size` bytes.
    pub fn check_upload_allowed(&self, incoming_size: u64) -> Result<(), WorkspaceError> {
        let files = scan_usage(&self.root_dir);
        let current_size: u64 = files.iter().map(|f| f.size).sum();
        if files.len() >= self.quota.max_files {
            return Err(WorkspaceError::QuotaExceeded {
                reason: format!("workspace file count limit reached ({})", self.quota.max_files),
            });
        }
        if current_size + incoming_size > self.quota.max_bytes {
            return Err(WorkspaceError::QuotaExceeded {
                reason: format!(
                    "workspace storage full (limit {:.1} MB)",
                    self.quota.max_size_mb()
                ),
            });
        }
        Ok(())
    }

    pub fn get_upload_dir(&self) -> Result<PathBuf, WorkspaceError> {
        let upload_dir = self.root_dir.join("uploads");
        fs::create_dir_all(&upload_dir)?;
        Ok(upload_dir)
    }
}

/// Execution environment handed to the code-execution subsystem.
///
/// Binds the workspace mount, the per-transaction CoW log location and
/// the staging map export; the Python wrapper reads these through the
/// environment-variable contract.
pub struct SandboxEnv {
    root_dir: PathBuf,
    docker_enabled: bool,
    transaction: Option<WorkspaceTransaction>,
}

impl SandboxEnv {
    pub fn docker_enabled(&self) -> bool {
        self.docker_enabled
    }

    pub fn docker_mount(&self) -> &Path {
        &self.root_dir
    }

    pub fn cow_log_path(&self) -> Result<PathBuf, WorkspaceError> {
        if let Some(tx) = &self.transaction {
            let short = &tx.tx_id()[..tx.tx_id().len().min(12)];
            return Ok(tx.staging_dir().join(format!("_cow_{}.log", short)));
        }
        let tmp = self.tmp_dir()?;
        let uniq = &uuid::Uuid::new_v4().simple().to_string()[..12];
        Ok(tmp.join(format!("_cow_{}.log", uniq)))
    }

    /// Staging map as JSON (`{"<abs_original>": "<abs_staged>", ...}`)
    /// for injection into the subprocess environment. `{}` when nothing
    /// is staged.
    pub fn staging_map_json(&self) -> String {
        let Some(tx) = &self.transaction else {
            return "{}".to_string();
        };
        let map: HashMap<String, String> = tx.staged_file_map();
        if map.is_empty() {
            return "{}".to_string();
        }
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn tmp_dir(&self) -> Result<PathBuf, WorkspaceError> {
        let tmp = self.root_dir.join(".tmp");
        fs::create_dir_all(&tmp)?;
        Ok(tmp)
    }

    pub fn transaction(&self) -> Option<&WorkspaceTransaction> {
        self.transaction.as_ref()
    }
}
