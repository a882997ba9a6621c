//! File metadata + provenance catalog over the workspace.
//!
//! Keyed by (workspace, canonical_path) with a hot in-memory cache over
//! the SQLite store. When versions are enabled the registry composes a
//! [`FileVersionManager`] and exposes the staging / CoW / checkpoint /
//! rollback surface through one façade.

pub mod entry;
pub mod panorama;
pub mod sheets;
pub mod store;

pub use entry::{
    detect_file_type, FileEntry, FileEvent, FileOrigin, FileType, ScanResult, SheetMeta,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::AgentError;
use crate::workspace::paths::{resolve_in_workspace, to_workspace_relative};
use crate::workspace::versions::{
    FileVersion, FileVersionManager, StagingScope, TurnCheckpoint, VersionReason,
};
use crate::workspace::WorkspaceError;
use entry::{new_id, now_iso, EXCEL_EXTENSIONS, SKIP_DIRS, SKIP_EXTENSIONS};
use store::FileRegistryStore;

const DEFAULT_SCAN_MAX_FILES: usize = 500;
const DEFAULT_HEADER_SCAN_ROWS: usize = 5;

struct Inner {
    store: FileRegistryStore,
    path_cache: HashMap<String, FileEntry>,
    id_to_path: HashMap<String, String>,
    alias_cache: HashMap<String, String>,
}

impl Inner {
    fn cache_entry(&mut self, entry: FileEntry) {
        self.id_to_path
            .insert(entry.id.clone(), entry.canonical_path.clone());
        self.path_cache.insert(entry.canonical_path.clone(), entry);
    }
}

pub struct FileRegistry {
    workspace_root: PathBuf,
    workspace_key: String,
    inner: Mutex<Inner>,
    fvm: Option<Arc<Mutex<FileVersionManager>>>,
}

impl FileRegistry {
    /// Registry backed by `{root}/data.db`, optionally composing a
    /// version manager.
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        enable_versions: bool,
    ) -> Result<Self, AgentError> {
        let workspace_root: PathBuf = workspace_root.into();
        std::fs::create_dir_all(&workspace_root).map_err(WorkspaceError::from)?;
        let store = FileRegistryStore::open(&workspace_root.join("data.db"))?;
        Self::with_store(workspace_root, store, enable_versions)
    }

    pub fn with_store(
        workspace_root: impl Into<PathBuf>,
        store: FileRegistryStore,
        enable_versions: bool,
    ) -> Result<Self, AgentError> {
        let workspace_root: PathBuf = workspace_root.into();
        let workspace_key = workspace_root.to_string_lossy().to_string();
        let fvm = if enable_versions {
            Some(Arc::new(Mutex::new(
                FileVersionManager::new(&workspace_root).map_err(AgentError::from)?,
            )))
        } else {
            None
        };
        let registry = Self {
            workspace_root,
            workspace_key,
            inner: Mutex::new(Inner {
                store,
                path_cache: HashMap::new(),
                id_to_path: HashMap::new(),
                alias_cache: HashMap::new(),
            }),
            fvm,
        };
        registry.load_cache();
        Ok(registry)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn has_versions(&self) -> bool {
        self.fvm.is_some()
    }

    pub fn fvm(&self) -> Option<&Arc<Mutex<FileVersionManager>>> {
        self.fvm.as_ref()
    }

    fn load_cache(&self) {
        let mut inner = self.inner.lock();
        let rows = match inner.store.list_all(&self.workspace_key, false) {
            Ok(rows) => rows,
            Err(err) => {
                log::debug!("registry cache load failed: {}", err);
                return;
            }
        };
        let mut aliases: Vec<(String, String)> = Vec::new();
        for row in rows {
            match inner.store.aliases_for_file(&row.id) {
                Ok(pairs) => {
                    for (_, value) in pairs {
                        aliases.push((value, row.id.clone()));
                    }
                }
                Err(err) => log::debug!("alias load failed for {}: {}", row.id, err),
            }
            inner.cache_entry(row);
        }
        for (value, id) in aliases {
            inner.alias_cache.insert(value, id);
        }
    }

    fn resolve(&self, file_path: &str) -> Result<PathBuf, WorkspaceError> {
        resolve_in_workspace(file_path, &self.workspace_root)
    }

    fn to_rel(&self, abs: &Path) -> String {
        to_workspace_relative(abs, &self.workspace_root)
    }

    // ── registration entry points ───────────────────────────────

    pub fn register_upload(
        &self,
        canonical_path: &str,
        original_name: &str,
        size_bytes: u64,
        session_id: Option<&str>,
        turn: Option<usize>,
        sheet_meta: Vec<SheetMeta>,
    ) -> Result<FileEntry, AgentError> {
        let now = now_iso();
        let mut inner = self.inner.lock();
        let existing = inner.path_cache.get(canonical_path).cloned();
        let entry = FileEntry {
            id: existing.as_ref().map(|e| e.id.clone()).unwrap_or_else(new_id),
            workspace: self.workspace_key.clone(),
            canonical_path: canonical_path.to_string(),
            original_name: original_name.to_string(),
            file_type: detect_file_type(canonical_path),
            size_bytes,
            origin: FileOrigin::Uploaded,
            origin_session_id: session_id.map(str::to_string),
            origin_turn: turn,
            origin_tool: None,
            parent_file_id: None,
            sheet_meta,
            content_hash: String::new(),
            mtime_ns: 0,
            created_at: existing
                .as_ref()
                .map(|e| e.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now.clone(),
            deleted_at: None,
        };
        inner.store.upsert_file(&entry)?;
        inner.cache_entry(entry.clone());

        if original_name != canonical_path {
            inner
                .store
                .add_alias(&new_id(), &entry.id, "display_name", original_name)?;
            inner
                .alias_cache
                .insert(original_name.to_string(), entry.id.clone());
        }

        Self::record_event_locked(
            &mut inner,
            &entry.id,
            "uploaded",
            session_id,
            turn,
            None,
            serde_json::json!({"original_name": original_name, "size_bytes": size_bytes}),
        );
        Ok(entry)
    }

    pub fn register_from_scan(
        &self,
        canonical_path: &str,
        original_name: &str,
        size_bytes: u64,
        mtime_ns: i64,
        sheet_meta: Option<Vec<SheetMeta>>,
        content_hash: &str,
    ) -> Result<FileEntry, AgentError> {
        let now = now_iso();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.path_cache.get(canonical_path).cloned() {
            let mut updated = existing;
            updated.size_bytes = size_bytes;
            updated.mtime_ns = mtime_ns;
            updated.file_type = detect_file_type(canonical_path);
            updated.content_hash = content_hash.to_string();
            if let Some(meta) = sheet_meta {
                updated.sheet_meta = meta;
            }
            updated.updated_at = now;
            updated.deleted_at = None; // resurrect
            inner.store.upsert_file(&updated)?;
            inner.cache_entry(updated.clone());
            return Ok(updated);
        }

        let entry = FileEntry {
            id: new_id(),
            workspace: self.workspace_key.clone(),
            canonical_path: canonical_path.to_string(),
            original_name: original_name.to_string(),
            file_type: detect_file_type(canonical_path),
            size_bytes,
            origin: FileOrigin::Scan,
            origin_session_id: None,
            origin_turn: None,
            origin_tool: None,
            parent_file_id: None,
            sheet_meta: sheet_meta.unwrap_or_default(),
            content_hash: content_hash.to_string(),
            mtime_ns,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        };
        inner.store.upsert_file(&entry)?;
        inner.cache_entry(entry.clone());
        Ok(entry)
    }

    pub fn register_agent_output(
        &self,
        canonical_path: &str,
        original_name: &str,
        parent_canonical: Option<&str>,
        session_id: Option<&str>,
        turn: Option<usize>,
        tool_name: Option<&str>,
    ) -> Result<FileEntry, AgentError> {
        let now = now_iso();
        let size_bytes = self
            .resolve(canonical_path)
            .ok()
            .and_then(|p| p.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0);

        let mut inner = self.inner.lock();
        let parent_id = parent_canonical
            .and_then(|p| inner.path_cache.get(p))
            .map(|e| e.id.clone());
        let existing = inner.path_cache.get(canonical_path).cloned();
        let entry = FileEntry {
            id: existing.as_ref().map(|e| e.id.clone()).unwrap_or_else(new_id),
            workspace: self.workspace_key.clone(),
            canonical_path: canonical_path.to_string(),
            original_name: original_name.to_string(),
            file_type: detect_file_type(canonical_path),
            size_bytes,
            origin: FileOrigin::AgentCreated,
            origin_session_id: session_id.map(str::to_string),
            origin_turn: turn,
            origin_tool: tool_name.map(str::to_string),
            parent_file_id: parent_id,
            sheet_meta: existing
                .as_ref()
                .map(|e| e.sheet_meta.clone())
                .unwrap_or_default(),
            content_hash: String::new(),
            mtime_ns: 0,
            created_at: existing
                .as_ref()
                .map(|e| e.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
            deleted_at: None,
        };
        inner.store.upsert_file(&entry)?;
        inner.cache_entry(entry.clone());

        Self::record_event_locked(
            &mut inner,
            &entry.id,
            "created",
            session_id,
            turn,
            tool_name,
            serde_json::json!({"parent": parent_canonical}),
        );
        Ok(entry)
    }

    pub fn register_backup(
        &self,
        backup_path: &str,
        parent_canonical: &str,
        reason: &str,
        session_id: Option<&str>,
        turn: Option<usize>,
        tool_name: Option<&str>,
    ) -> Result<FileEntry, AgentError> {
        let now = now_iso();
        let mut inner = self.inner.lock();
        let parent_id = inner
            .path_cache
            .get(parent_canonical)
            .map(|e| e.id.clone());
        let existing = inner.path_cache.get(backup_path).cloned();
        let entry = FileEntry {
            id: existing.as_ref().map(|e| e.id.clone()).unwrap_or_else(new_id),
            workspace: self.workspace_key.clone(),
            canonical_path: backup_path.to_string(),
            original_name: Path::new(backup_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| backup_path.to_string()),
            file_type: detect_file_type(backup_path),
            size_bytes: 0,
            origin: FileOrigin::Backup,
            origin_session_id: session_id.map(str::to_string),
            origin_turn: turn,
            origin_tool: tool_name.map(str::to_string),
            parent_file_id: parent_id,
            sheet_meta: Vec::new(),
            content_hash: String::new(),
            mtime_ns: 0,
            created_at: existing
                .as_ref()
                .map(|e| e.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
            deleted_at: None,
        };
        inner.store.upsert_file(&entry)?;
        inner.cache_entry(entry.clone());

        Self::record_event_locked(
            &mut inner,
            &entry.id,
            "backed_up",
            session_id,
            turn,
            tool_name,
            serde_json::json!({"reason": reason, "parent": parent_canonical}),
        );
        Ok(entry)
    }

    pub fn register_cow(
        &self,
        cow_path: &str,
        parent_canonical: &str,
        session_id: Option<&str>,
        turn: Option<usize>,
    ) -> Result<FileEntry, AgentError> {
        let now = now_iso();
        let mut inner = self.inner.lock();
        let parent_id = inner
            .path_cache
            .get(parent_canonical)
            .map(|e| e.id.clone());
        let existing = inner.path_cache.get(cow_path).cloned();
        let entry = FileEntry {
            id: existing.as_ref().map(|e| e.id.clone()).unwrap_or_else(new_id),
            workspace: self.workspace_key.clone(),
            canonical_path: cow_path.to_string(),
            original_name: Path::new(cow_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| cow_path.to_string()),
            file_type: detect_file_type(cow_path),
            size_bytes: 0,
            origin: FileOrigin::CowCopy,
            origin_session_id: session_id.map(str::to_string),
            origin_turn: turn,
            origin_tool: None,
            parent_file_id: parent_id,
            sheet_meta: Vec::new(),
            content_hash: String::new(),
            mtime_ns: 0,
            created_at: existing
                .as_ref()
                .map(|e| e.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
            deleted_at: None,
        };
        inner.store.upsert_file(&entry)?;
        inner.cache_entry(entry.clone());

        inner
            .store
            .add_alias(&new_id(), &entry.id, "cow_path", cow_path)?;
        inner
            .alias_cache
            .insert(cow_path.to_string(), entry.id.clone());

        Self::record_event_locked(
            &mut inner,
            &entry.id,
            "cow_created",
            session_id,
            turn,
            None,
            serde_json::json!({"parent": parent_canonical}),
        );
        Ok(entry)
    }

    fn record_event_locked(
        inner: &mut Inner,
        file_id: &str,
        event_type: &str,
        session_id: Option<&str>,
        turn: Option<usize>,
        tool_name: Option<&str>,
        details: serde_json::Value,
    ) {
        let event = FileEvent {
            id: new_id(),
            file_id: file_id.to_string(),
            event_type: event_type.to_string(),
            session_id: session_id.map(str::to_string),
            turn,
            tool_name: tool_name.map(str::to_string),
            details,
            created_at: now_iso(),
        };
        if let Err(err) = inner.store.add_event(&event) {
            log::debug!("failed to record file event: {}", err);
        }
    }

    // ── queries ─────────────────────────────────────────────────

    pub fn get_by_path(&self, canonical_path: &str) -> Option<FileEntry> {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.path_cache.get(canonical_path) {
            return Some(cached.clone());
        }
        match inner.store.get_by_path(&self.workspace_key, canonical_path) {
            Ok(Some(entry)) => {
                inner.cache_entry(entry.clone());
                Some(entry)
            }
            _ => None,
        }
    }

    pub fn get_by_alias(&self, alias_value: &str) -> Option<FileEntry> {
        let mut inner = self.inner.lock();
        if let Some(file_id) = inner.alias_cache.get(alias_value).cloned() {
            if let Some(path) = inner.id_to_path.get(&file_id).cloned() {
                if let Some(entry) = inner.path_cache.get(&path) {
                    return Some(entry.clone());
                }
            }
        }
        match inner.store.find_by_alias(alias_value) {
            Ok(Some(entry)) => {
                inner.cache_entry(entry.clone());
                Some(entry)
            }
            _ => None,
        }
    }

    pub fn get_by_id(&self, file_id: &str) -> Option<FileEntry> {
        let mut inner = self.inner.lock();
        if let Some(path) = inner.id_to_path.get(file_id).cloned() {
            if let Some(entry) = inner.path_cache.get(&path) {
                return Some(entry.clone());
            }
        }
        match inner.store.get_by_id(file_id) {
            Ok(Some(entry)) => {
                inner.cache_entry(entry.clone());
                Some(entry)
            }
            _ => None,
        }
    }

    pub fn list_all(&self, include_deleted: bool) -> Vec<FileEntry> {
        let inner = self.inner.lock();
        if !include_deleted {
            let mut entries: Vec<FileEntry> = inner
                .path_cache
                .values()
                .filter(|e| e.is_active())
                .cloned()
                .collect();
            entries.sort_by(|a, b| a.canonical_path.cmp(&b.canonical_path));
            return entries;
        }
        inner
            .store
            .list_all(&self.workspace_key, true)
            .unwrap_or_default()
    }

    pub fn get_children(&self, file_id: &str) -> Vec<FileEntry> {
        self.inner
            .lock()
            .store
            .get_children(file_id)
            .unwrap_or_default()
    }

    /// Ancestor chain from the file up to its root parent.
    pub fn get_lineage(&self, file_id: &str) -> Vec<FileEntry> {
        let inner = self.inner.lock();
        let mut result = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut current = Some(file_id.to_string());
        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                break;
            }
            let Ok(Some(entry)) = inner.store.get_by_id(&id) else {
                break;
            };
            current = entry.parent_file_id.clone();
            result.push(entry);
        }
        result
    }

    pub fn get_events(&self, file_id: &str) -> Vec<FileEvent> {
        self.inner
            .lock()
            .store
            .get_events(file_id)
            .unwrap_or_default()
    }

    // ── path resolution ─────────────────────────────────────────

    /// Any path or alias → the canonical path a tool should use.
    /// Lookup order: canonical path, alias, original name, passthrough.
    pub fn resolve_for_tool(&self, path_or_alias: &str) -> String {
        {
            let inner = self.inner.lock();
            if inner.path_cache.contains_key(path_or_alias) {
                return path_or_alias.to_string();
            }
        }
        if let Some(entry) = self.get_by_alias(path_or_alias) {
            return entry.canonical_path;
        }
        {
            let inner = self.inner.lock();
            for entry in inner.path_cache.values() {
                if entry.is_active() && entry.original_name == path_or_alias {
                    return entry.canonical_path.clone();
                }
            }
        }
        path_or_alias.to_string()
    }

    /// Canonical path → user-friendly display name.
    pub fn resolve_for_display(&self, canonical_path: &str) -> String {
        let inner = self.inner.lock();
        if let Some(entry) = inner.path_cache.get(canonical_path) {
            return entry.original_name.clone();
        }
        Path::new(canonical_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| canonical_path.to_string())
    }

    /// Soft delete: the file vanished from disk but its provenance
    /// stays queryable.
    pub fn mark_deleted(&self, canonical_path: &str) {
        let now = now_iso();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.path_cache.get_mut(canonical_path) {
            entry.deleted_at = Some(now.clone());
            entry.updated_at = now.clone();
        }
        if let Err(err) = inner
            .store
            .soft_delete(&self.workspace_key, canonical_path, &now)
        {
            log::debug!("soft delete failed for {}: {}", canonical_path, err);
        }
    }

    pub fn add_alias(&self, file_id: &str, alias_type: &str, alias_value: &str) {
        let mut inner = self.inner.lock();
        if let Err(err) = inner
            .store
            .add_alias(&new_id(), file_id, alias_type, alias_value)
        {
            log::debug!("alias insert failed: {}", err);
            return;
        }
        inner
            .alias_cache
            .insert(alias_value.to_string(), file_id.to_string());
    }

    // ── panorama ────────────────────────────────────────────────

    pub fn build_panorama(&self) -> String {
        let inner = self.inner.lock();
        let entries: Vec<FileEntry> = inner.path_cache.values().cloned().collect();
        let id_to_name: HashMap<String, String> = entries
            .iter()
            .map(|e| (e.id.clone(), e.original_name.clone()))
            .collect();
        drop(inner);
        panorama::build_panorama(&entries, |id| {
            id_to_name.get(id).cloned().unwrap_or_else(|| "-".to_string())
        })
    }

    // ── scanning ────────────────────────────────────────────────

    /// Recursively scan the workspace, registering new files, updating
    /// changed ones (mtime+size cache hits are skipped) and
    /// soft-deleting scan-origin entries whose files vanished.
    pub fn scan_workspace(&self) -> ScanResult {
        self.scan_workspace_with(DEFAULT_SCAN_MAX_FILES, DEFAULT_HEADER_SCAN_ROWS, false)
    }

    pub fn scan_workspace_with(
        &self,
        max_files: usize,
        header_scan_rows: usize,
        excel_only: bool,
    ) -> ScanResult {
        let start = Instant::now();
        let mut result = ScanResult::default();

        let collected = self.collect_file_paths(max_files, excel_only);
        let mut current_rel_paths: std::collections::HashSet<String> =
            std::collections::HashSet::new();

        for path in collected {
            let Ok(meta) = path.metadata() else { continue };
            let rel_path = self.to_rel(&path);
            current_rel_paths.insert(rel_path.clone());
            let mtime_ns = mtime_ns_of(&meta);

            let existing = self.get_by_path(&rel_path);
            if let Some(existing) = &existing {
                if existing.mtime_ns == mtime_ns && existing.size_bytes == meta.len() {
                    result.cache_hits += 1;
                    continue;
                }
            }

            let file_type = detect_file_type(&rel_path);
            let sheet_meta = if matches!(file_type, FileType::Excel | FileType::Csv) {
                match sheets::scan_file_sheets(&path, header_scan_rows) {
                    Ok(meta) => Some(meta),
                    Err(err) => {
                        log::debug!("sheet scan failed for {}: {}", path.display(), err);
                        None
                    }
                }
            } else {
                None
            };

            if existing.is_some() {
                result.updated_files += 1;
            } else {
                result.new_files += 1;
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Err(err) =
                self.register_from_scan(&rel_path, &name, meta.len(), mtime_ns, sheet_meta, "")
            {
                log::warn!("scan registration failed for {}: {}", rel_path, err);
            }
        }

        // soft-delete scan-origin entries whose files vanished
        let vanished: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .path_cache
                .values()
                .filter(|e| {
                    e.origin == FileOrigin::Scan
                        && e.is_active()
                        && !current_rel_paths.contains(&e.canonical_path)
                })
                .map(|e| e.canonical_path.clone())
                .collect()
        };
        for path in vanished {
            self.mark_deleted(&path);
            result.deleted_files += 1;
        }

        result.total_files = current_rel_paths.len();
        result.scan_duration_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "registry scan: {} files ({} new, {} updated, {} deleted, {} cache hits) in {}ms",
            result.total_files,
            result.new_files,
            result.updated_files,
            result.deleted_files,
            result.cache_hits,
            result.scan_duration_ms,
        );
        result
    }

    /// Scan only `uploads/`, registering untracked files there.
    pub fn scan_uploads(&self) -> ScanResult {
        let start = Instant::now();
        let mut result = ScanResult::default();
        let uploads_dir = self.workspace_root.join("uploads");
        if !uploads_dir.exists() {
            return result;
        }

        for path in walk_files(&uploads_dir, usize::MAX, false) {
            let Ok(meta) = path.metadata() else { continue };
            let rel_path = self.to_rel(&path);
            let mtime_ns = mtime_ns_of(&meta);
            result.total_files += 1;

            if let Some(mut existing) = self.get_by_path(&rel_path) {
                if existing.mtime_ns == mtime_ns && existing.size_bytes == meta.len() {
                    result.cache_hits += 1;
                    continue;
                }
                if existing.mtime_ns == 0 && existing.size_bytes == meta.len() {
                    // register_upload does not set mtime; backfill it
                    existing.mtime_ns = mtime_ns;
                    existing.updated_at = now_iso();
                    let mut inner = self.inner.lock();
                    let _ = inner.store.upsert_file(&existing);
                    inner.cache_entry(existing);
                    result.cache_hits += 1;
                    continue;
                }
                existing.mtime_ns = mtime_ns;
                existing.size_bytes = meta.len();
                existing.updated_at = now_iso();
                let mut inner = self.inner.lock();
                let _ = inner.store.upsert_file(&existing);
                inner.cache_entry(existing);
                result.updated_files += 1;
                continue;
            }

            let file_type = detect_file_type(&rel_path);
            let sheet_meta = if matches!(file_type, FileType::Excel | FileType::Csv) {
                sheets::scan_file_sheets(&path, DEFAULT_HEADER_SCAN_ROWS).ok()
            } else {
                None
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Err(err) =
                self.register_from_scan(&rel_path, &name, meta.len(), mtime_ns, sheet_meta, "")
            {
                log::warn!("upload scan registration failed for {}: {}", rel_path, err);
            } else {
                result.new_files += 1;
            }
        }
        result.scan_duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    fn collect_file_paths(&self, max_files: usize, excel_only: bool) -> Vec<PathBuf> {
        let mut paths = walk_files(&self.workspace_root, max_files, excel_only);
        paths.sort_by_key(|p| self.to_rel(p).to_lowercase());
        paths
    }

    // ── staging / CoW / checkpoint delegation layer ─────────────

    /// Ensure the file has an original snapshot and return the staged
    /// copy path; the copy is also registered as backup metadata.
    pub fn stage_for_write(
        &self,
        file_path: &str,
        ref_id: &str,
        scope: StagingScope,
    ) -> Result<PathBuf, WorkspaceError> {
        let Some(fvm) = &self.fvm else {
            return self.resolve(file_path);
        };
        let staged = fvm.lock().stage_for_write(file_path, ref_id, scope)?;

        if let Ok(resolved) = self.resolve(file_path) {
            let rel = self.to_rel(&resolved);
            let staged_rel = self.to_rel(&staged);
            if staged_rel != rel {
                if let Err(err) =
                    self.register_backup(&staged_rel, &rel, "staging", None, None, None)
                {
                    log::debug!("stage_for_write backup registration failed: {}", err);
                }
            }
        }
        Ok(staged)
    }

    pub fn get_staged_path(&self, file_path: &str) -> Option<PathBuf> {
        let fvm = self.fvm.as_ref()?;
        fvm.lock().get_staged_path(file_path).ok().flatten()
    }

    pub fn register_cow_mapping(&self, src_rel: &str, dst_rel: &str) {
        if let Some(fvm) = &self.fvm {
            if let Err(err) = fvm.lock().register_cow_mapping(src_rel, dst_rel) {
                log::warn!("CoW mapping registration failed: {}", err);
                return;
            }
        }
        if let Err(err) = self.register_cow(dst_rel, src_rel, None, None) {
            log::debug!("CoW metadata registration failed: {}", err);
        }
    }

    pub fn lookup_cow_redirect(&self, rel_path: &str) -> Option<PathBuf> {
        let fvm = self.fvm.as_ref()?;
        let redirect = fvm.lock().lookup_cow_redirect(rel_path);
        redirect
    }

    pub fn checkpoint_file(
        &self,
        file_path: &str,
        reason: VersionReason,
        ref_id: &str,
    ) -> Result<Option<FileVersion>, WorkspaceError> {
        match &self.fvm {
            Some(fvm) => fvm.lock().checkpoint(file_path, reason, ref_id),
            None => Ok(None),
        }
    }

    pub fn create_turn_checkpoint(
        &self,
        turn: usize,
        dirty_files: &[String],
        tool_names: &[String],
    ) -> Option<TurnCheckpoint> {
        let fvm = self.fvm.as_ref()?;
        let checkpoint = fvm.lock().create_turn_checkpoint(turn, dirty_files, tool_names);
        checkpoint
    }

    pub fn rollback_to_turn(&self, turn: usize) -> Vec<String> {
        match &self.fvm {
            Some(fvm) => fvm.lock().rollback_to_turn(turn),
            None => Vec::new(),
        }
    }

    pub fn list_turn_checkpoints(&self) -> Vec<TurnCheckpoint> {
        match &self.fvm {
            Some(fvm) => fvm.lock().list_turn_checkpoints().to_vec(),
            None => Vec::new(),
        }
    }

    pub fn invalidate_undo(&self, rel_paths: &[String]) -> usize {
        match &self.fvm {
            Some(fvm) => fvm.lock().invalidate_undo(rel_paths),
            None => 0,
        }
    }

    pub fn gc_versions(&self, max_age_seconds: i64) -> usize {
        match &self.fvm {
            Some(fvm) => fvm.lock().gc(max_age_seconds),
            None => 0,
        }
    }

    pub fn staged_file_map(&self) -> HashMap<String, String> {
        match &self.fvm {
            Some(fvm) => fvm.lock().staged_file_map(),
            None => HashMap::new(),
        }
    }

    pub fn prune_stale_staging(&self) -> usize {
        match &self.fvm {
            Some(fvm) => fvm.lock().prune_stale_staging(),
            None => 0,
        }
    }
}

fn mtime_ns_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Collect candidate files under `root`, honoring the skip lists.
/// Hidden files and directories are skipped by the walker defaults.
fn walk_files(root: &Path, max_files: usize, excel_only: bool) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let walker = ignore::WalkBuilder::new(root)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                return !SKIP_DIRS.contains(&name.as_ref());
            }
            !name.starts_with("~$")
        })
        .build();

    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.into_path();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if excel_only {
            if !EXCEL_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
        } else if SKIP_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        paths.push(path);
        if paths.len() >= max_files {
            break;
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> FileRegistry {
        FileRegistry::with_store(
            dir.path(),
            FileRegistryStore::open_in_memory().unwrap(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn register_upload_then_resolve_by_original_name() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register_upload(
            "uploads/report_8f3a.xlsx",
            "Quarterly Report.xlsx",
            1234,
            Some("s1"),
            Some(0),
            vec![],
        )
        .unwrap();

        // alias lookup
        assert_eq!(
            reg.resolve_for_tool("Quarterly Report.xlsx"),
            "uploads/report_8f3a.xlsx"
        );
        // canonical passthrough
        assert_eq!(
            reg.resolve_for_tool("uploads/report_8f3a.xlsx"),
            "uploads/report_8f3a.xlsx"
        );
        // unknown input falls through untouched
        assert_eq!(reg.resolve_for_tool("nope.xlsx"), "nope.xlsx");
        // display resolution
        assert_eq!(
            reg.resolve_for_display("uploads/report_8f3a.xlsx"),
            "Quarterly Report.xlsx"
        );
    }

    #[test]
    fn upload_records_provenance_event() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let entry = reg
            .register_upload("uploads/a.csv", "a.csv", 10, Some("s1"), Some(2), vec![])
            .unwrap();
        let events = reg.get_events(&entry.id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "uploaded");
        assert_eq!(events[0].session_id.as_deref(), Some("s1"));
        assert_eq!(events[0].turn, Some(2));
    }

    #[test]
    fn scan_registers_updates_and_soft_deletes() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        fs::create_dir_all(dir.path().join("uploads")).unwrap();
        let csv = dir.path().join("uploads/data.csv");
        fs::write(&csv, "a,b\n1,2\n").unwrap();

        let first = reg.scan_workspace();
        assert_eq!(first.new_files, 1);

        // unchanged: cache hit
        let second = reg.scan_workspace();
        assert_eq!(second.cache_hits, 1);
        assert_eq!(second.new_files, 0);

        // grow the file so mtime/size change
        fs::write(&csv, "a,b\n1,2\n3,4\n").unwrap();
        let third = reg.scan_workspace();
        assert_eq!(third.updated_files, 1);

        // vanish: soft delete, provenance retained
        fs::remove_file(&csv).unwrap();
        let fourth = reg.scan_workspace();
        assert_eq!(fourth.deleted_files, 1);
        let entry = reg.get_by_path("uploads/data.csv").unwrap();
        assert!(entry.deleted_at.is_some());
    }

    #[test]
    fn scan_captures_csv_sheet_metadata() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        fs::write(dir.path().join("table.csv"), "name,qty\nwidget,7\n").unwrap();
        reg.scan_workspace();
        let entry = reg.get_by_path("table.csv").unwrap();
        assert_eq!(entry.file_type, FileType::Csv);
        assert_eq!(entry.sheet_meta.len(), 1);
        assert_eq!(entry.sheet_meta[0].headers, vec!["name", "qty"]);
    }

    #[test]
    fn scan_skips_noise_dirs_and_binary_extensions() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/x.csv"), "a").unwrap();
        fs::write(dir.path().join("lib.so"), "bin").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        reg.scan_workspace();
        assert!(reg.get_by_path("node_modules/pkg/x.csv").is_none());
        assert!(reg.get_by_path("lib.so").is_none());
        assert!(reg.get_by_path("notes.txt").is_some());
    }

    #[test]
    fn stage_for_write_registers_backup_metadata() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        fs::write(dir.path().join("report.csv"), "x").unwrap();
        reg.scan_workspace();

        let staged = reg
            .stage_for_write("report.csv", "tx1", StagingScope::All)
            .unwrap();
        let staged_rel = staged
            .strip_prefix(dir.path())
            .unwrap()
            .to_string_lossy()
            .to_string();
        let backup = reg.get_by_path(&staged_rel).unwrap();
        assert_eq!(backup.origin, FileOrigin::Backup);
        let parent = reg.get_by_id(backup.parent_file_id.as_deref().unwrap()).unwrap();
        assert_eq!(parent.canonical_path, "report.csv");
    }

    #[test]
    fn cow_registration_creates_alias_and_lineage() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        fs::create_dir_all(dir.path().join("outputs/backups")).unwrap();
        fs::write(dir.path().join("uploads.csv"), "orig").unwrap();
        fs::write(dir.path().join("outputs/backups/uploads.csv"), "copy").unwrap();
        reg.scan_workspace();

        reg.register_cow_mapping("uploads.csv", "outputs/backups/uploads.csv");

        let redirect = reg.lookup_cow_redirect("uploads.csv").unwrap();
        assert!(redirect.ends_with("outputs/backups/uploads.csv"));
        let cow = reg.get_by_path("outputs/backups/uploads.csv").unwrap();
        assert_eq!(cow.origin, FileOrigin::CowCopy);
        let lineage = reg.get_lineage(&cow.id);
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage[1].canonical_path, "uploads.csv");
    }

    #[test]
    fn panorama_lists_registered_files() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register_upload("uploads/a.csv", "a.csv", 10, None, None, vec![])
            .unwrap();
        let panorama = reg.build_panorama();
        assert!(panorama.contains("Workspace file panorama"));
        assert!(panorama.contains("a.csv"));
    }

    #[test]
    fn registry_without_versions_degrades_gracefully() {
        let dir = TempDir::new().unwrap();
        let reg = FileRegistry::with_store(
            dir.path(),
            FileRegistryStore::open_in_memory().unwrap(),
            false,
        )
        .unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();

        // no staging: the canonical path comes back
        let staged = reg.stage_for_write("a.csv", "tx", StagingScope::All).unwrap();
        assert_eq!(staged, dir.path().join("a.csv"));
        assert!(reg.create_turn_checkpoint(1, &["a.csv".to_string()], &[]).is_none());
        assert!(reg.rollback_to_turn(1).is_empty());
    }
}
