//! Versioned, quota-enforced per-user workspaces.
//!
//! Every path that crosses the core boundary resolves through
//! [`paths::resolve_in_workspace`]; nothing opens an attacker-supplied
//! path verbatim.

pub mod isolated;
pub mod paths;
pub mod quota;
pub mod transaction;
pub mod versions;

pub use isolated::{IsolatedWorkspace, SandboxConfig, SandboxEnv};
pub use paths::{resolve_in_workspace, to_workspace_relative};
pub use quota::{QuotaPolicy, WorkspaceUsage};
pub use transaction::WorkspaceTransaction;
pub use versions::{FileVersion, FileVersionManager, StagingScope, TurnCheckpoint, VersionReason};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path is outside the workspace: {path}")]
    OutsideWorkspace { path: String },

    #[error("version not found: {version_id}")]
    VersionNotFound { version_id: String },

    #[error("version invalidated, cannot restore: {version_id}")]
    VersionInvalidated { version_id: String },

    #[error("snapshot file missing: {snapshot_path}")]
    SnapshotMissing { snapshot_path: String },

    #[error("quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
