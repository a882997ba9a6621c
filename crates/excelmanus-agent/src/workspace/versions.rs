//! Content-addressed, append-only file snapshot store.
//!
//! Converges the three historical protection mechanisms (transaction
//! staging, approval snapshots, CoW registry) into a single version
//! chain per file with role labels. One instance per session engine,
//! never a process-wide singleton.
//!
//! Chain invariants:
//! - versions are appended in creation order; the first element of a
//!   chain is the original pre-mutation snapshot
//! - a snapshot file is never overwritten; dedup happens by content
//!   hash against the chain head
//! - `invalidate_undo` flips versions to unrestorable after a commit so
//!   undo cannot resurrect pre-commit content

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::paths::{resolve_in_workspace, to_workspace_relative};
use super::WorkspaceError;

const EXCEL_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb", "csv"];
const MAX_TURN_CHECKPOINTS: usize = 30;

/// Why a version snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionReason {
    Staging,
    Audit,
    Cow,
    Restore,
    Manual,
    Turn,
}

/// One snapshot of one file at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub version_id: String,
    /// Workspace-relative path (normalized, forward slashes).
    pub file_path: String,
    /// Absolute path of the snapshot blob; `None` for a tombstone
    /// (the file did not exist when the checkpoint was taken).
    pub snapshot_path: Option<PathBuf>,
    pub reason: VersionReason,
    /// Grouping id: tx_id, approval_id, cow destination or `turn:N`.
    pub ref_id: String,
    pub created_at: i64,
    pub original_existed: bool,
    /// SHA-256 hex of the content; empty for tombstones.
    pub content_hash: String,
    /// Set after a commit; restore refuses invalidated versions.
    pub invalidated: bool,
}

/// Staging snapshot set recorded at the end of one tool-loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCheckpoint {
    pub turn_number: usize,
    pub created_at: i64,
    pub version_ids: Vec<String>,
    pub files_modified: Vec<String>,
    pub tool_names: Vec<String>,
}

/// Active redirection from an original path to its working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagingEntry {
    original_abs: PathBuf,
    staged_abs: PathBuf,
    rel_path: String,
}

/// Scope restriction for [`FileVersionManager::stage_for_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingScope {
    All,
    ExcelOnly,
}

impl StagingScope {
    pub fn parse(value: &str) -> Self {
        if value == "excel_only" {
            StagingScope::ExcelOnly
        } else {
            StagingScope::All
        }
    }
}

pub struct FileVersionManager {
    workspace_root: PathBuf,
    versions_dir: PathBuf,
    /// rel path → versions, oldest first. Insertion-ordered so
    /// `list_all_tracked` reports files in first-touch order.
    chains: IndexMap<String, Vec<FileVersion>>,
    /// ref_id → (rel path, version_id)
    ref_index: HashMap<String, Vec<(String, String)>>,
    /// rel path → active staging entry
    staging: HashMap<String, StagingEntry>,
    turn_checkpoints: Vec<TurnCheckpoint>,
    max_turn_checkpoints: usize,
}

impl FileVersionManager {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let workspace_root = workspace_root.into();
        let versions_dir = workspace_root.join("outputs").join(".versions");
        Self::with_versions_dir(workspace_root, versions_dir)
    }

    pub fn with_versions_dir(
        workspace_root: impl Into<PathBuf>,
        versions_dir: impl Into<PathBuf>,
    ) -> Result<Self, WorkspaceError> {
        let workspace_root = workspace_root.into();
        let versions_dir = versions_dir.into();
        fs::create_dir_all(&versions_dir)?;
        let mut manager = Self {
            workspace_root,
            versions_dir,
            chains: IndexMap::new(),
            ref_index: HashMap::new(),
            staging: HashMap::new(),
            turn_checkpoints: Vec::new(),
            max_turn_checkpoints: MAX_TURN_CHECKPOINTS,
        };
        manager.load_staging();
        Ok(manager)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn versions_dir(&self) -> &Path {
        &self.versions_dir
    }

    // ── staging sidecar persistence ─────────────────────────────

    fn staging_json_path(&self) -> PathBuf {
        self.versions_dir.join("_staging.json")
    }

    /// Persist the staging map so a crash does not lose redirects.
    /// Atomic via temp-file + rename.
    fn save_staging(&self) {
        let entries: Vec<&StagingEntry> = self.staging.values().collect();
        let json = match serde_json::to_string(&entries) {
            Ok(json) => json,
            Err(err) => {
                log::debug!("failed to serialize staging map: {}", err);
                return;
            }
        };
        let target = self.staging_json_path();
        let tmp = target.with_extension("tmp");
        if let Err(err) = fs::write(&tmp, json).and_then(|_| fs::rename(&tmp, &target)) {
            log::debug!("failed to persist staging map: {}", err);
        }
    }

    /// Reload the staging map, silently dropping entries whose staged
    /// file no longer exists on disk.
    fn load_staging(&mut self) {
        let path = self.staging_json_path();
        if !path.exists() {
            return;
        }
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) => {
                log::debug!("failed to read staging map: {}", err);
                return;
            }
        };
        let entries: Vec<StagingEntry> = match serde_json::from_str(&data) {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!("failed to parse staging map: {}", err);
                return;
            }
        };
        for entry in entries {
            if !entry.staged_abs.exists() {
                continue;
            }
            self.staging.insert(entry.rel_path.clone(), entry);
        }
        log::debug!("restored {} staging entries from disk", self.staging.len());
    }

    // ── path helpers ────────────────────────────────────────────

    fn resolve(&self, file_path: &str) -> Result<PathBuf, WorkspaceError> {
        resolve_in_workspace(file_path, &self.workspace_root)
    }

    fn to_rel(&self, abs_path: &Path) -> String {
        to_workspace_relative(abs_path, &self.workspace_root)
    }

    fn version_store_dir(&self, version_id: &str) -> PathBuf {
        self.versions_dir.join(&version_id[..2]).join(version_id)
    }

    fn new_version_id() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..12].to_string()
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn file_hash(path: &Path) -> Result<String, WorkspaceError> {
        let mut hasher = Sha256::new();
        let mut file = fs::File::open(path)?;
        let mut buf = [0u8; 1 << 16];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    // ── version creation ────────────────────────────────────────

    /// Create a version snapshot for a file.
    ///
    /// Content is read through an active staging redirect when one
    /// exists, so checkpoints taken after a staged write capture the
    /// written content. Records a tombstone when the file does not
    /// exist. Returns `None` when the content hash equals the latest
    /// version in the chain (dedup).
    pub fn checkpoint(
        &mut self,
        file_path: &str,
        reason: VersionReason,
        ref_id: &str,
    ) -> Result<Option<FileVersion>, WorkspaceError> {
        let resolved = self.resolve(file_path)?;
        let rel = self.to_rel(&resolved);
        let source = self
            .staging
            .get(&rel)
            .map(|e| e.staged_abs.clone())
            .filter(|p| p.is_file())
            .unwrap_or_else(|| resolved.clone());
        let existed = source.is_file();

        if !existed {
            let version = FileVersion {
                version_id: Self::new_version_id(),
                file_path: rel,
                snapshot_path: None,
                reason,
                ref_id: ref_id.to_string(),
                created_at: Self::now(),
                original_existed: false,
                content_hash: String::new(),
                invalidated: false,
            };
            self.append_version(version.clone());
            return Ok(Some(version));
        }

        let content_hash = Self::file_hash(&source)?;
        if let Some(chain) = self.chains.get(&rel) {
            if let Some(last) = chain.last() {
                if last.content_hash == content_hash {
                    return Ok(None);
                }
            }
        }

        let version_id = Self::new_version_id();
        let store_dir = self.version_store_dir(&version_id);
        fs::create_dir_all(&store_dir)?;
        let basename = resolved
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        let snapshot_path = store_dir.join(basename);
        if let Err(err) = fs::copy(&source, &snapshot_path) {
            // leave the store consistent: drop the partial directory
            let _ = fs::remove_dir_all(&store_dir);
            return Err(err.into());
        }

        let version = FileVersion {
            version_id,
            file_path: rel,
            snapshot_path: Some(snapshot_path),
            reason,
            ref_id: ref_id.to_string(),
            created_at: Self::now(),
            original_existed: true,
            content_hash,
            invalidated: false,
        };
        self.append_version(version.clone());
        Ok(Some(version))
    }

    /// Batch checkpoint; per-file failures are logged, not propagated.
    pub fn checkpoint_many(
        &mut self,
        file_paths: &[String],
        reason: VersionReason,
        ref_id: &str,
    ) -> Vec<FileVersion> {
        let mut results = Vec::new();
        for path in file_paths {
            match self.checkpoint(path, reason, ref_id) {
                Ok(Some(version)) => results.push(version),
                Ok(None) => {}
                Err(err) => log::warn!("checkpoint failed for {}: {}", path, err),
            }
        }
        results
    }

    fn append_version(&mut self, version: FileVersion) {
        if !version.ref_id.is_empty() {
            self.ref_index
                .entry(version.ref_id.clone())
                .or_default()
                .push((version.file_path.clone(), version.version_id.clone()));
        }
        self.chains
            .entry(version.file_path.clone())
            .or_default()
            .push(version);
    }

    // ── version queries ─────────────────────────────────────────

    /// The earliest version (the true original state).
    pub fn get_original(&self, file_path: &str) -> Result<Option<FileVersion>, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        Ok(self.chains.get(&rel).and_then(|c| c.first()).cloned())
    }

    pub fn get_latest(&self, file_path: &str) -> Result<Option<FileVersion>, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        Ok(self.chains.get(&rel).and_then(|c| c.last()).cloned())
    }

    pub fn list_versions(&self, file_path: &str) -> Result<Vec<FileVersion>, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        Ok(self.chains.get(&rel).cloned().unwrap_or_default())
    }

    pub fn list_by_ref(&self, ref_id: &str) -> Vec<FileVersion> {
        let Some(pairs) = self.ref_index.get(ref_id) else {
            return Vec::new();
        };
        pairs
            .iter()
            .filter_map(|(rel, vid)| {
                self.chains
                    .get(rel)
                    .and_then(|chain| chain.iter().find(|v| &v.version_id == vid))
                    .cloned()
            })
            .collect()
    }

    pub fn list_all_tracked(&self) -> Vec<String> {
        self.chains.keys().cloned().collect()
    }

    // ── restore ─────────────────────────────────────────────────

    /// Restore a file to a specific version.
    ///
    /// Like every other write in the store, the restore goes through an
    /// active staging redirect: with a staging entry present the
    /// snapshot lands in the staged copy and the canonical file stays
    /// untouched. The restore itself is recorded as a new version so
    /// the chain stays append-only. Refuses invalidated versions.
    pub fn restore(&mut self, file_path: &str, version_id: &str) -> Result<bool, WorkspaceError> {
        let resolved = self.resolve(file_path)?;
        let rel = self.to_rel(&resolved);
        let Some(target) = self
            .chains
            .get(&rel)
            .and_then(|chain| chain.iter().find(|v| v.version_id == version_id))
            .cloned()
        else {
            return Ok(false);
        };

        if target.invalidated {
            log::warn!("version {} is invalidated, refusing restore", version_id);
            return Ok(false);
        }

        let destination = self
            .staging
            .get(&rel)
            .map(|entry| entry.staged_abs.clone())
            .unwrap_or_else(|| resolved.clone());

        if !target.original_existed {
            // tombstone: the file did not exist at checkpoint time
            if destination.exists() {
                fs::remove_file(&destination)?;
            }
            return Ok(true);
        }

        let Some(snapshot) = target.snapshot_path.as_ref() else {
            return Ok(false);
        };
        if !snapshot.exists() {
            log::warn!("snapshot file missing: {}", snapshot.display());
            return Ok(false);
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(snapshot, &destination)?;

        self.checkpoint(file_path, VersionReason::Restore, version_id)?;
        Ok(true)
    }

    pub fn restore_to_original(&mut self, file_path: &str) -> Result<bool, WorkspaceError> {
        match self.get_original(file_path)? {
            Some(original) => self.restore(file_path, &original.version_id),
            None => Ok(false),
        }
    }

    // ── staging ─────────────────────────────────────────────────

    /// Ensure the file has an original snapshot and return its staged
    /// working-copy path. Idempotent: subsequent calls return the
    /// cached staged path. Files outside the scope, or missing files,
    /// come back as the original path with no staging.
    pub fn stage_for_write(
        &mut self,
        file_path: &str,
        ref_id: &str,
        scope: StagingScope,
    ) -> Result<PathBuf, WorkspaceError> {
        let resolved = self.resolve(file_path)?;
        let rel = self.to_rel(&resolved);

        if let Some(entry) = self.staging.get(&rel) {
            return Ok(entry.staged_abs.clone());
        }

        if scope == StagingScope::ExcelOnly {
            let ext = resolved
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !EXCEL_EXTENSIONS.contains(&ext.as_str()) {
                return Ok(resolved);
            }
        }

        if !resolved.is_file() {
            return Ok(resolved);
        }

        self.checkpoint(file_path, VersionReason::Staging, ref_id)?;

        let staging_dir = self.workspace_root.join("outputs").join("backups");
        fs::create_dir_all(&staging_dir)?;
        let stem = resolved
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let ext = resolved
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let format = time::macros::format_description!("[year][month][day]T[hour][minute][second]");
        let ts = OffsetDateTime::now_utc()
            .format(&format)
            .unwrap_or_else(|_| "00000000T000000".to_string());
        let uniq = &uuid::Uuid::new_v4().simple().to_string()[..4];
        let staged_path = staging_dir.join(format!("{}_{}_{}{}", stem, ts, uniq, ext));
        fs::copy(&resolved, &staged_path)?;

        self.staging.insert(
            rel.clone(),
            StagingEntry {
                original_abs: resolved,
                staged_abs: staged_path.clone(),
                rel_path: rel,
            },
        );
        self.save_staging();
        Ok(staged_path)
    }

    /// Staged working-copy path for a file, if one is active.
    pub fn get_staged_path(&self, file_path: &str) -> Result<Option<PathBuf>, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        Ok(self.staging.get(&rel).map(|e| e.staged_abs.clone()))
    }

    pub fn has_staging(&self, file_path: &str) -> Result<bool, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        Ok(self.staging.contains_key(&rel))
    }

    /// Copy the staged content back to the original location and drop
    /// the entry. The version chain stays intact.
    /// Returns `(original, staged)` or `None` when nothing was staged.
    pub fn commit_staged(
        &mut self,
        file_path: &str,
    ) -> Result<Option<(PathBuf, PathBuf)>, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        let Some(entry) = self.staging.remove(&rel) else {
            return Ok(None);
        };
        if entry.staged_abs.exists() {
            if let Some(parent) = entry.original_abs.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&entry.staged_abs, &entry.original_abs)?;
        }
        self.save_staging();
        Ok(Some((entry.original_abs, entry.staged_abs)))
    }

    pub fn commit_all_staged(&mut self) -> Result<Vec<(PathBuf, PathBuf)>, WorkspaceError> {
        let mut results = Vec::new();
        let entries: Vec<StagingEntry> = self.staging.drain().map(|(_, e)| e).collect();
        for entry in entries {
            if entry.staged_abs.exists() {
                if let Some(parent) = entry.original_abs.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&entry.staged_abs, &entry.original_abs)?;
            }
            results.push((entry.original_abs, entry.staged_abs));
        }
        self.save_staging();
        Ok(results)
    }

    /// Delete the staged file and drop the entry; the original is
    /// untouched.
    pub fn discard_staged(&mut self, file_path: &str) -> Result<bool, WorkspaceError> {
        let rel = self.to_rel(&self.resolve(file_path)?);
        let Some(entry) = self.staging.remove(&rel) else {
            return Ok(false);
        };
        if entry.staged_abs.exists() {
            fs::remove_file(&entry.staged_abs)?;
        }
        self.save_staging();
        Ok(true)
    }

    pub fn discard_all_staged(&mut self) -> Result<usize, WorkspaceError> {
        let count = self.staging.len();
        for entry in self.staging.values() {
            if entry.staged_abs.exists() {
                fs::remove_file(&entry.staged_abs)?;
            }
        }
        self.staging.clear();
        self.save_staging();
        Ok(count)
    }

    /// `original_abs → staged_abs` map, injected into sandbox
    /// subprocesses so they see the same redirection.
    pub fn staged_file_map(&self) -> HashMap<String, String> {
        self.staging
            .values()
            .map(|e| {
                (
                    e.original_abs.to_string_lossy().to_string(),
                    e.staged_abs.to_string_lossy().to_string(),
                )
            })
            .collect()
    }

    pub fn list_staged(&self) -> Vec<(PathBuf, PathBuf)> {
        self.staging
            .values()
            .map(|e| (e.original_abs.clone(), e.staged_abs.clone()))
            .collect()
    }

    /// Register a copy-on-write mapping reported by a subprocess.
    /// Recorded as both a staging entry and a `cow` version snapshot.
    pub fn register_cow_mapping(
        &mut self,
        src_rel: &str,
        dst_rel: &str,
    ) -> Result<(), WorkspaceError> {
        let src_abs = self.resolve(src_rel)?;
        let dst_abs = self.resolve(dst_rel)?;
        let rel = self.to_rel(&src_abs);

        if self.staging.contains_key(&rel) {
            return Ok(());
        }

        self.checkpoint(src_rel, VersionReason::Cow, dst_rel)?;
        self.staging.insert(
            rel.clone(),
            StagingEntry {
                original_abs: src_abs,
                staged_abs: dst_abs,
                rel_path: rel,
            },
        );
        self.save_staging();
        Ok(())
    }

    /// CoW/staging redirect for a workspace-relative path, if any.
    pub fn lookup_cow_redirect(&self, rel_path: &str) -> Option<PathBuf> {
        self.staging.get(rel_path).map(|e| e.staged_abs.clone())
    }

    pub fn cow_mappings(&self) -> HashMap<String, String> {
        self.staging
            .iter()
            .map(|(rel, e)| (rel.clone(), self.to_rel(&e.staged_abs)))
            .collect()
    }

    /// Drop the staging entry for a deleted file. The staged copy is
    /// kept on disk as a backup; only the mapping goes away.
    pub fn remove_staging_for_path(&mut self, file_path: &str) -> bool {
        let Ok(resolved) = self.resolve(file_path) else {
            return false;
        };
        let rel = self.to_rel(&resolved);
        if self.staging.remove(&rel).is_none() {
            return false;
        }
        self.save_staging();
        true
    }

    /// Re-key a staging entry after the original file was renamed.
    pub fn rename_staging_path(&mut self, old_path: &str, new_path: &str) -> bool {
        let (Ok(old_resolved), Ok(new_resolved)) = (self.resolve(old_path), self.resolve(new_path))
        else {
            return false;
        };
        let old_rel = self.to_rel(&old_resolved);
        let new_rel = self.to_rel(&new_resolved);
        let Some(entry) = self.staging.remove(&old_rel) else {
            return false;
        };
        self.staging.insert(
            new_rel.clone(),
            StagingEntry {
                original_abs: new_resolved,
                staged_abs: entry.staged_abs,
                rel_path: new_rel,
            },
        );
        self.save_staging();
        true
    }

    /// Drop entries whose staged file no longer exists (crash recovery).
    pub fn prune_stale_staging(&mut self) -> usize {
        let stale: Vec<String> = self
            .staging
            .iter()
            .filter(|(_, e)| !e.staged_abs.exists())
            .map(|(rel, _)| rel.clone())
            .collect();
        for rel in &stale {
            self.staging.remove(rel);
        }
        if !stale.is_empty() {
            self.save_staging();
        }
        stale.len()
    }

    // ── undo invalidation ───────────────────────────────────────

    /// Mark every version of the given files as unrestorable. Called
    /// after a commit so undo cannot reach pre-commit snapshots.
    pub fn invalidate_undo(&mut self, file_paths: &[String]) -> usize {
        let mut count = 0;
        for path in file_paths {
            let Ok(resolved) = self.resolve(path) else {
                continue;
            };
            let rel = self.to_rel(&resolved);
            if let Some(chain) = self.chains.get_mut(&rel) {
                for version in chain.iter_mut() {
                    if !version.invalidated {
                        version.invalidated = true;
                        count += 1;
                    }
                }
            }
        }
        count
    }

    // ── turn checkpoints ────────────────────────────────────────

    /// Snapshot the dirty files of one loop iteration.
    ///
    /// Unchanged files dedup to nothing; when every file was unchanged
    /// no checkpoint is recorded and `None` comes back. The buffer
    /// evicts its oldest entry past the limit.
    pub fn create_turn_checkpoint(
        &mut self,
        turn_number: usize,
        dirty_files: &[String],
        tool_names: &[String],
    ) -> Option<TurnCheckpoint> {
        let ref_id = format!("turn:{}", turn_number);
        let mut version_ids = Vec::new();
        let mut files_modified = Vec::new();

        for path in dirty_files {
            match self.checkpoint(path, VersionReason::Turn, &ref_id) {
                Ok(Some(version)) => {
                    version_ids.push(version.version_id);
                    files_modified.push(version.file_path);
                }
                Ok(None) => {}
                Err(err) => log::warn!("turn checkpoint failed for {}: {}", path, err),
            }
        }

        if version_ids.is_empty() {
            return None;
        }

        let checkpoint = TurnCheckpoint {
            turn_number,
            created_at: Self::now(),
            version_ids,
            files_modified,
            tool_names: tool_names.to_vec(),
        };
        self.turn_checkpoints.push(checkpoint.clone());
        while self.turn_checkpoints.len() > self.max_turn_checkpoints {
            self.turn_checkpoints.remove(0);
        }
        Some(checkpoint)
    }

    /// Roll every file touched at or after `turn_number` back to its
    /// last version from before that turn (or the earliest recorded
    /// version when none exists). Files under active staging revert in
    /// their staged copy; canonical files are only written when no
    /// redirect exists. The rolled-back checkpoints are dropped from
    /// the buffer.
    ///
    /// Returns the restored file paths; empty when `turn_number` is
    /// beyond every recorded checkpoint.
    pub fn rollback_to_turn(&mut self, turn_number: usize) -> Vec<String> {
        let Some(affected_idx) = self
            .turn_checkpoints
            .iter()
            .position(|cp| cp.turn_number >= turn_number)
        else {
            return Vec::new();
        };

        let mut files_to_restore: Vec<String> = Vec::new();
        for checkpoint in &self.turn_checkpoints[affected_idx..] {
            for path in &checkpoint.files_modified {
                if !files_to_restore.contains(path) {
                    files_to_restore.push(path.clone());
                }
            }
        }

        let mut restored = Vec::new();
        for rel_path in files_to_restore {
            let Some(chain) = self.chains.get(&rel_path) else {
                continue;
            };
            if chain.is_empty() {
                continue;
            }

            // latest version from before the rollback boundary
            let mut target: Option<FileVersion> = None;
            for version in chain {
                if version.reason == VersionReason::Turn {
                    if let Some(turn) = version
                        .ref_id
                        .strip_prefix("turn:")
                        .and_then(|n| n.parse::<usize>().ok())
                    {
                        if turn >= turn_number {
                            break;
                        }
                    }
                }
                target = Some(version.clone());
            }
            // no prior version: best-effort restore to the earliest one
            let target = target.unwrap_or_else(|| chain[0].clone());

            // restore() writes through an active staging redirect, so
            // files under staging revert in their staged copy while the
            // canonical file is left alone
            match self.restore(&rel_path, &target.version_id) {
                Ok(true) => restored.push(rel_path.clone()),
                Ok(false) => {}
                Err(err) => log::warn!("rollback restore failed for {}: {}", rel_path, err),
            }
        }

        self.turn_checkpoints.truncate(affected_idx);
        restored
    }

    pub fn list_turn_checkpoints(&self) -> &[TurnCheckpoint] {
        &self.turn_checkpoints
    }

    // ── cleanup ─────────────────────────────────────────────────

    /// Remove middle-of-chain versions older than the TTL. The first
    /// and last version of every chain are always kept. Physical
    /// snapshot files and their now-empty parent directories go too.
    pub fn gc(&mut self, max_age_seconds: i64) -> usize {
        let cutoff = Self::now() - max_age_seconds;
        let mut removed = 0;

        for chain in self.chains.values_mut() {
            if chain.len() <= 1 {
                continue;
            }
            let last_idx = chain.len() - 1;
            let mut keep = Vec::with_capacity(chain.len());
            for (idx, version) in chain.drain(..).enumerate() {
                if idx == 0 || idx == last_idx || version.created_at >= cutoff {
                    keep.push(version);
                    continue;
                }
                if let Some(snapshot) = &version.snapshot_path {
                    if snapshot.exists() {
                        let _ = fs::remove_file(snapshot);
                    }
                    if let Some(parent) = snapshot.parent() {
                        let _ = fs::remove_dir(parent);
                        if let Some(grandparent) = parent.parent() {
                            let _ = fs::remove_dir(grandparent);
                        }
                    }
                }
                removed += 1;
            }
            *chain = keep;
        }

        // rebuild the ref index from what survived
        self.ref_index.clear();
        for chain in self.chains.values() {
            for version in chain {
                if !version.ref_id.is_empty() {
                    self.ref_index
                        .entry(version.ref_id.clone())
                        .or_default()
                        .push((version.file_path.clone(), version.version_id.clone()));
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileVersionManager) {
        let dir = TempDir::new().unwrap();
        let manager = FileVersionManager::new(dir.path()).unwrap();
        (dir, manager)
    }

    fn write_file(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    // ── checkpoint ─────────────────────────────────────────────

    #[test]
    fn checkpoint_copies_content_and_dedups() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "report.csv", "a,b\n1,2\n");

        let first = fvm
            .checkpoint("report.csv", VersionReason::Manual, "")
            .unwrap();
        assert!(first.is_some());
        let version = first.unwrap();
        assert!(version.snapshot_path.as_ref().unwrap().exists());
        assert!(version.original_existed);
        assert!(!version.content_hash.is_empty());

        // unchanged content dedups to None
        let second = fvm
            .checkpoint("report.csv", VersionReason::Manual, "")
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn checkpoint_missing_file_records_tombstone() {
        let (_dir, mut fvm) = setup();
        let version = fvm
            .checkpoint("ghost.csv", VersionReason::Manual, "")
            .unwrap()
            .unwrap();
        assert!(version.snapshot_path.is_none());
        assert!(!version.original_existed);
        assert!(version.content_hash.is_empty());
    }

    #[test]
    fn checkpoint_outside_workspace_fails() {
        let (_dir, mut fvm) = setup();
        let err = fvm
            .checkpoint("/etc/passwd", VersionReason::Manual, "")
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::OutsideWorkspace { .. }));
    }

    #[test]
    fn chain_first_element_is_original() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "v1");
        fvm.checkpoint("data.csv", VersionReason::Staging, "tx1")
            .unwrap();
        fs::write(&path, "v2").unwrap();
        fvm.checkpoint("data.csv", VersionReason::Turn, "turn:1")
            .unwrap();

        let versions = fvm.list_versions("data.csv").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].reason, VersionReason::Staging);
        let original = fvm.get_original("data.csv").unwrap().unwrap();
        assert_eq!(original.version_id, versions[0].version_id);
    }

    // ── staging laws ───────────────────────────────────────────

    #[test]
    fn stage_then_commit_applies_staged_content() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "old");

        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        assert_ne!(staged, original);
        assert!(staged.starts_with(dir.path().join("outputs/backups")));

        fs::write(&staged, "new").unwrap();
        // the original is untouched until commit
        assert_eq!(fs::read_to_string(&original).unwrap(), "old");

        fvm.commit_staged("report.csv").unwrap().unwrap();
        assert_eq!(fs::read_to_string(&original).unwrap(), "new");
        assert!(!fvm.has_staging("report.csv").unwrap());
    }

    #[test]
    fn stage_then_discard_leaves_original_content() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "old");

        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        fs::write(&staged, "new").unwrap();

        assert!(fvm.discard_staged("report.csv").unwrap());
        assert_eq!(fs::read_to_string(&original).unwrap(), "old");
        assert!(!staged.exists());
    }

    #[test]
    fn stage_for_write_is_idempotent() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "report.csv", "data");
        let first = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        let second = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn excel_only_scope_skips_other_extensions() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "notes.txt", "text");
        let staged = fvm
            .stage_for_write("notes.txt", "tx1", StagingScope::ExcelOnly)
            .unwrap();
        assert_eq!(staged, original);
        assert!(!fvm.has_staging("notes.txt").unwrap());
    }

    #[test]
    fn staging_creates_original_version_first() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "report.csv", "old");
        fvm.stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        let versions = fvm.list_versions("report.csv").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].reason, VersionReason::Staging);
        assert_eq!(versions[0].ref_id, "tx1");
    }

    #[test]
    fn checkpoint_reads_through_active_staging() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "original");
        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        fs::write(&staged, "staged edit").unwrap();

        let version = fvm
            .checkpoint("report.csv", VersionReason::Turn, "turn:1")
            .unwrap()
            .unwrap();
        let snapshot = version.snapshot_path.unwrap();
        assert_eq!(fs::read_to_string(snapshot).unwrap(), "staged edit");
        assert_eq!(fs::read_to_string(&original).unwrap(), "original");
    }

    #[test]
    fn staged_file_map_exposes_absolute_pairs() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "x");
        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        let map = fvm.staged_file_map();
        assert_eq!(
            map.get(&original.to_string_lossy().to_string()),
            Some(&staged.to_string_lossy().to_string())
        );
    }

    // ── sidecar persistence ────────────────────────────────────

    #[test]
    fn staging_map_survives_reload() {
        let dir = TempDir::new().unwrap();
        let staged = {
            let mut fvm = FileVersionManager::new(dir.path()).unwrap();
            write_file(dir.path(), "report.csv", "x");
            fvm.stage_for_write("report.csv", "tx1", StagingScope::All)
                .unwrap()
        };

        let fvm = FileVersionManager::new(dir.path()).unwrap();
        assert_eq!(fvm.get_staged_path("report.csv").unwrap(), Some(staged));
    }

    #[test]
    fn reload_drops_entries_with_missing_staged_files() {
        let dir = TempDir::new().unwrap();
        let staged = {
            let mut fvm = FileVersionManager::new(dir.path()).unwrap();
            write_file(dir.path(), "report.csv", "x");
            fvm.stage_for_write("report.csv", "tx1", StagingScope::All)
                .unwrap()
        };
        fs::remove_file(&staged).unwrap();

        let fvm = FileVersionManager::new(dir.path()).unwrap();
        assert_eq!(fvm.get_staged_path("report.csv").unwrap(), None);
    }

    #[test]
    fn prune_stale_staging_counts_removed_entries() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "a.csv", "1");
        write_file(dir.path(), "b.csv", "2");
        let staged_a = fvm.stage_for_write("a.csv", "tx", StagingScope::All).unwrap();
        fvm.stage_for_write("b.csv", "tx", StagingScope::All).unwrap();
        fs::remove_file(&staged_a).unwrap();

        assert_eq!(fvm.prune_stale_staging(), 1);
        assert!(!fvm.has_staging("a.csv").unwrap());
        assert!(fvm.has_staging("b.csv").unwrap());
    }

    // ── restore / invalidate ───────────────────────────────────

    #[test]
    fn restore_records_a_new_version() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "v1");
        let v1 = fvm
            .checkpoint("data.csv", VersionReason::Manual, "")
            .unwrap()
            .unwrap();
        fs::write(&path, "v2").unwrap();
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();

        assert!(fvm.restore("data.csv", &v1.version_id).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "v1");
        let versions = fvm.list_versions("data.csv").unwrap();
        assert_eq!(versions.last().unwrap().reason, VersionReason::Restore);
        assert_eq!(versions.last().unwrap().ref_id, v1.version_id);
    }

    #[test]
    fn restore_refuses_invalidated_versions() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "v1");
        let v1 = fvm
            .checkpoint("data.csv", VersionReason::Manual, "")
            .unwrap()
            .unwrap();
        fs::write(&path, "v2").unwrap();

        assert_eq!(fvm.invalidate_undo(&["data.csv".to_string()]), 1);
        assert!(!fvm.restore("data.csv", &v1.version_id).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "v2");
    }

    #[test]
    fn restore_tombstone_deletes_the_file() {
        let (dir, mut fvm) = setup();
        let tombstone = fvm
            .checkpoint("late.csv", VersionReason::Manual, "")
            .unwrap()
            .unwrap();
        let path = write_file(dir.path(), "late.csv", "created later");

        assert!(fvm.restore("late.csv", &tombstone.version_id).unwrap());
        assert!(!path.exists());
    }

    // ── turn checkpoints and rollback ──────────────────────────

    #[test]
    fn unchanged_files_produce_no_checkpoint() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "data.csv", "same");
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();

        let checkpoint = fvm.create_turn_checkpoint(
            1,
            &["data.csv".to_string()],
            &["write_cells".to_string()],
        );
        assert!(checkpoint.is_none());
        assert!(fvm.list_turn_checkpoints().is_empty());
    }

    #[test]
    fn rollback_restores_pre_turn_content() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "turn0");
        fvm.create_turn_checkpoint(0, &["data.csv".to_string()], &[]);

        fs::write(&path, "turn1").unwrap();
        fvm.create_turn_checkpoint(1, &["data.csv".to_string()], &[]);
        fs::write(&path, "turn2").unwrap();
        fvm.create_turn_checkpoint(2, &["data.csv".to_string()], &[]);

        let restored = fvm.rollback_to_turn(1);
        assert_eq!(restored, vec!["data.csv".to_string()]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "turn0");
        // rolled-back checkpoints are gone
        assert_eq!(fvm.list_turn_checkpoints().len(), 1);
        assert_eq!(fvm.list_turn_checkpoints()[0].turn_number, 0);
    }

    #[test]
    fn rollback_past_last_checkpoint_is_a_no_op() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "content");
        fvm.create_turn_checkpoint(1, &["data.csv".to_string()], &[]);

        let restored = fvm.rollback_to_turn(99);
        assert!(restored.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "content");
        assert_eq!(fvm.list_turn_checkpoints().len(), 1);
    }

    #[test]
    fn rollback_to_mid_chain_restores_staged_copy_only() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "v0");
        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();

        // two real staged writes across two turns; the canonical file
        // is never written
        fs::write(&staged, "v1").unwrap();
        fvm.create_turn_checkpoint(1, &["report.csv".to_string()], &[]);
        fs::write(&staged, "v2").unwrap();
        fvm.create_turn_checkpoint(2, &["report.csv".to_string()], &[]);
        assert_eq!(fs::read_to_string(&original).unwrap(), "v0");

        // undo turn 2: the staged copy reverts to the turn-1 content
        let restored = fvm.rollback_to_turn(2);
        assert_eq!(restored, vec!["report.csv".to_string()]);
        assert_eq!(fs::read_to_string(&staged).unwrap(), "v1");
        assert_eq!(fs::read_to_string(&original).unwrap(), "v0");
        assert_eq!(fvm.list_turn_checkpoints().len(), 1);
    }

    #[test]
    fn rollback_to_first_turn_restores_staged_copy_to_original_content() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "v0");
        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();

        fs::write(&staged, "v1").unwrap();
        fvm.create_turn_checkpoint(1, &["report.csv".to_string()], &[]);
        fs::write(&staged, "v2").unwrap();
        fvm.create_turn_checkpoint(2, &["report.csv".to_string()], &[]);

        let restored = fvm.rollback_to_turn(1);
        assert_eq!(restored, vec!["report.csv".to_string()]);
        // the staged copy carries the pre-mutation content again and
        // the canonical file was never touched
        assert_eq!(fs::read_to_string(&staged).unwrap(), "v0");
        assert_eq!(fs::read_to_string(&original).unwrap(), "v0");
        assert!(fvm.list_turn_checkpoints().is_empty());
    }

    #[test]
    fn restore_writes_through_active_staging_redirect() {
        let (dir, mut fvm) = setup();
        let original = write_file(dir.path(), "report.csv", "v0");
        let staged = fvm
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        fs::write(&staged, "v1").unwrap();
        let v1 = fvm
            .checkpoint("report.csv", VersionReason::Turn, "turn:1")
            .unwrap()
            .unwrap();
        fs::write(&staged, "v2").unwrap();
        fvm.checkpoint("report.csv", VersionReason::Turn, "turn:2")
            .unwrap()
            .unwrap();

        assert!(fvm.restore("report.csv", &v1.version_id).unwrap());
        assert_eq!(fs::read_to_string(&staged).unwrap(), "v1");
        assert_eq!(fs::read_to_string(&original).unwrap(), "v0");
    }

    #[test]
    fn checkpoint_buffer_evicts_oldest() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "0");
        for turn in 0..35 {
            fs::write(&path, format!("content-{}", turn)).unwrap();
            fvm.create_turn_checkpoint(turn, &["data.csv".to_string()], &[]);
        }
        let checkpoints = fvm.list_turn_checkpoints();
        assert_eq!(checkpoints.len(), 30);
        assert_eq!(checkpoints[0].turn_number, 5);
    }

    // ── gc ─────────────────────────────────────────────────────

    #[test]
    fn gc_keeps_first_and_last_versions() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "v1");
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();
        fs::write(&path, "v2").unwrap();
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();
        fs::write(&path, "v3").unwrap();
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();

        // everything is "old" with a negative TTL; middle goes, ends stay
        let removed = fvm.gc(-10);
        assert_eq!(removed, 1);
        let versions = fvm.list_versions("data.csv").unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].snapshot_path.as_ref().unwrap().exists());
        assert!(versions[1].snapshot_path.as_ref().unwrap().exists());
    }

    #[test]
    fn gc_within_ttl_removes_nothing() {
        let (dir, mut fvm) = setup();
        let path = write_file(dir.path(), "data.csv", "v1");
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();
        fs::write(&path, "v2").unwrap();
        fvm.checkpoint("data.csv", VersionReason::Manual, "").unwrap();

        assert_eq!(fvm.gc(3600), 0);
        assert_eq!(fvm.list_versions("data.csv").unwrap().len(), 2);
    }

    // ── CoW mappings ───────────────────────────────────────────

    #[test]
    fn cow_mapping_registers_staging_and_version() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "uploads/data.csv", "protected");
        write_file(dir.path(), "outputs/backups/data.csv", "copy");

        fvm.register_cow_mapping("uploads/data.csv", "outputs/backups/data.csv")
            .unwrap();

        let redirect = fvm.lookup_cow_redirect("uploads/data.csv").unwrap();
        assert!(redirect.ends_with("outputs/backups/data.csv"));
        let versions = fvm.list_versions("uploads/data.csv").unwrap();
        assert_eq!(versions[0].reason, VersionReason::Cow);
    }

    #[test]
    fn cow_mapping_does_not_clobber_existing_staging() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "uploads/data.csv", "x");
        let staged = fvm
            .stage_for_write("uploads/data.csv", "tx1", StagingScope::All)
            .unwrap();
        write_file(dir.path(), "outputs/backups/other.csv", "y");

        fvm.register_cow_mapping("uploads/data.csv", "outputs/backups/other.csv")
            .unwrap();
        assert_eq!(
            fvm.get_staged_path("uploads/data.csv").unwrap(),
            Some(staged)
        );
    }

    #[test]
    fn rename_staging_path_rekeys_entry() {
        let (dir, mut fvm) = setup();
        write_file(dir.path(), "old.csv", "x");
        let staged = fvm
            .stage_for_write("old.csv", "tx1", StagingScope::All)
            .unwrap();

        assert!(fvm.rename_staging_path("old.csv", "new.csv"));
        assert_eq!(fvm.get_staged_path("old.csv").unwrap(), None);
        assert_eq!(fvm.get_staged_path("new.csv").unwrap(), Some(staged));
    }
}
