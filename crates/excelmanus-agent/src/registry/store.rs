//! SQLite persistence for the file registry.
//!
//! Three tables: `files` (one row per canonical path per workspace),
//! `file_aliases` (unique per alias_type + value) and `file_events`
//! (append-only provenance). The registry keeps a hot cache in memory;
//! the store is the durable side.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::entry::{FileEntry, FileEvent, FileOrigin, FileType, SheetMeta};
use crate::error::AgentError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    workspace TEXT NOT NULL,
    canonical_path TEXT NOT NULL,
    original_name TEXT NOT NULL,
    file_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    origin TEXT NOT NULL,
    origin_session_id TEXT,
    origin_turn INTEGER,
    origin_tool TEXT,
    parent_file_id TEXT,
    sheet_meta TEXT NOT NULL DEFAULT '[]',
    content_hash TEXT NOT NULL DEFAULT '',
    mtime_ns INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    UNIQUE(workspace, canonical_path)
);
CREATE TABLE IF NOT EXISTS file_aliases (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    alias_type TEXT NOT NULL,
    alias_value TEXT NOT NULL,
    UNIQUE(alias_type, alias_value)
);
CREATE TABLE IF NOT EXISTS file_events (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    session_id TEXT,
    turn INTEGER,
    tool_name TEXT,
    details TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_workspace ON files(workspace);
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_file_id);
CREATE INDEX IF NOT EXISTS idx_events_file ON file_events(file_id);
";

pub struct FileRegistryStore {
    conn: Connection,
}

impl FileRegistryStore {
    pub fn open(path: &std::path::Path) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn upsert_file(&self, entry: &FileEntry) -> Result<(), AgentError> {
        let sheet_meta = serde_json::to_string(&entry.sheet_meta)?;
        self.conn.execute(
            "INSERT INTO files (id, workspace, canonical_path, original_name, file_type,
                 size_bytes, origin, origin_session_id, origin_turn, origin_tool,
                 parent_file_id, sheet_meta, content_hash, mtime_ns,
                 created_at, updated_at, deleted_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
             ON CONFLICT(workspace, canonical_path) DO UPDATE SET
                 original_name=excluded.original_name,
                 file_type=excluded.file_type,
                 size_bytes=excluded.size_bytes,
                 origin=excluded.origin,
                 origin_session_id=excluded.origin_session_id,
                 origin_turn=excluded.origin_turn,
                 origin_tool=excluded.origin_tool,
                 parent_file_id=excluded.parent_file_id,
                 sheet_meta=excluded.sheet_meta,
                 content_hash=excluded.content_hash,
                 mtime_ns=excluded.mtime_ns,
                 updated_at=excluded.updated_at,
                 deleted_at=excluded.deleted_at",
            params![
                entry.id,
                entry.workspace,
                entry.canonical_path,
                entry.original_name,
                entry.file_type.as_str(),
                entry.size_bytes as i64,
                entry.origin.as_str(),
                entry.origin_session_id,
                entry.origin_turn.map(|t| t as i64),
                entry.origin_tool,
                entry.parent_file_id,
                sheet_meta,
                entry.content_hash,
                entry.mtime_ns,
                entry.created_at,
                entry.updated_at,
                entry.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_by_path(
        &self,
        workspace: &str,
        canonical_path: &str,
    ) -> Result<Option<FileEntry>, AgentError> {
        self.conn
            .query_row(
                "SELECT * FROM files WHERE workspace = ?1 AND canonical_path = ?2",
                params![workspace, canonical_path],
                row_to_entry,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_by_id(&self, file_id: &str) -> Result<Option<FileEntry>, AgentError> {
        self.conn
            .query_row(
                "SELECT * FROM files WHERE id = ?1",
                params![file_id],
                row_to_entry,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn find_by_alias(&self, alias_value: &str) -> Result<Option<FileEntry>, AgentError> {
        self.conn
            .query_row(
                "SELECT f.* FROM files f
                 JOIN file_aliases a ON a.file_id = f.id
                 WHERE a.alias_value = ?1
                 LIMIT 1",
                params![alias_value],
                row_to_entry,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_all(
        &self,
        workspace: &str,
        include_deleted: bool,
    ) -> Result<Vec<FileEntry>, AgentError> {
        let sql = if include_deleted {
            "SELECT * FROM files WHERE workspace = ?1 ORDER BY canonical_path"
        } else {
            "SELECT * FROM files WHERE workspace = ?1 AND deleted_at IS NULL ORDER BY canonical_path"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![workspace], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_children(&self, file_id: &str) -> Result<Vec<FileEntry>, AgentError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM files WHERE parent_file_id = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![file_id], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn soft_delete(
        &self,
        workspace: &str,
        canonical_path: &str,
        deleted_at: &str,
    ) -> Result<(), AgentError> {
        self.conn.execute(
            "UPDATE files SET deleted_at = ?3, updated_at = ?3
             WHERE workspace = ?1 AND canonical_path = ?2",
            params![workspace, canonical_path, deleted_at],
        )?;
        Ok(())
    }

    /// Insert an alias; a collision within one alias_type is ignored
    /// (first registration wins).
    pub fn add_alias(
        &self,
        alias_id: &str,
        file_id: &str,
        alias_type: &str,
        alias_value: &str,
    ) -> Result<(), AgentError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO file_aliases (id, file_id, alias_type, alias_value)
             VALUES (?1, ?2, ?3, ?4)",
            params![alias_id, file_id, alias_type, alias_value],
        )?;
        Ok(())
    }

    pub fn aliases_for_file(&self, file_id: &str) -> Result<Vec<(String, String)>, AgentError> {
        let mut stmt = self
            .conn
            .prepare("SELECT alias_type, alias_value FROM file_aliases WHERE file_id = ?1")?;
        let rows = stmt.query_map(params![file_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn add_event(&self, event: &FileEvent) -> Result<(), AgentError> {
        let details = serde_json::to_string(&event.details)?;
        self.conn.execute(
            "INSERT INTO file_events (id, file_id, event_type, session_id, turn, tool_name, details, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                event.id,
                event.file_id,
                event.event_type,
                event.session_id,
                event.turn.map(|t| t as i64),
                event.tool_name,
                details,
                event.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_events(&self, file_id: &str) -> Result<Vec<FileEvent>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_id, event_type, session_id, turn, tool_name, details, created_at
             FROM file_events WHERE file_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            let details_raw: String = row.get(6)?;
            Ok(FileEvent {
                id: row.get(0)?,
                file_id: row.get(1)?,
                event_type: row.get(2)?,
                session_id: row.get(3)?,
                turn: row.get::<_, Option<i64>>(4)?.map(|t| t as usize),
                tool_name: row.get(5)?,
                details: serde_json::from_str(&details_raw)
                    .unwrap_or(serde_json::Value::Null),
                created_at: row.get(7)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
    let file_type: String = row.get("file_type")?;
    let origin: String = row.get("origin")?;
    let sheet_meta_raw: String = row.get("sheet_meta")?;
    let sheet_meta: Vec<SheetMeta> = serde_json::from_str(&sheet_meta_raw).unwrap_or_default();
    Ok(FileEntry {
        id: row.get("id")?,
        workspace: row.get("workspace")?,
        canonical_path: row.get("canonical_path")?,
        original_name: row.get("original_name")?,
        file_type: FileType::parse(&file_type),
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        origin: FileOrigin::parse(&origin),
        origin_session_id: row.get("origin_session_id")?,
        origin_turn: row
            .get::<_, Option<i64>>("origin_turn")?
            .map(|t| t as usize),
        origin_tool: row.get("origin_tool")?,
        parent_file_id: row.get("parent_file_id")?,
        sheet_meta,
        content_hash: row.get("content_hash")?,
        mtime_ns: row.get("mtime_ns")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::entry::{new_id, now_iso};

    fn entry(path: &str) -> FileEntry {
        let now = now_iso();
        FileEntry {
            id: new_id(),
            workspace: "/ws".to_string(),
            canonical_path: path.to_string(),
            original_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_type: FileType::Csv,
            size_bytes: 10,
            origin: FileOrigin::Scan,
            origin_session_id: None,
            origin_turn: None,
            origin_tool: None,
            parent_file_id: None,
            sheet_meta: vec![],
            content_hash: String::new(),
            mtime_ns: 0,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let store = FileRegistryStore::open_in_memory().unwrap();
        let e = entry("uploads/a.csv");
        store.upsert_file(&e).unwrap();

        let loaded = store.get_by_path("/ws", "uploads/a.csv").unwrap().unwrap();
        assert_eq!(loaded.id, e.id);
        assert_eq!(loaded.file_type, FileType::Csv);

        // upsert with same path updates in place
        let mut updated = e.clone();
        updated.size_bytes = 99;
        store.upsert_file(&updated).unwrap();
        let loaded = store.get_by_path("/ws", "uploads/a.csv").unwrap().unwrap();
        assert_eq!(loaded.size_bytes, 99);
    }

    #[test]
    fn canonical_path_is_unique_per_workspace() {
        let store = FileRegistryStore::open_in_memory().unwrap();
        store.upsert_file(&entry("uploads/a.csv")).unwrap();
        let second = entry("uploads/a.csv");
        store.upsert_file(&second).unwrap();
        assert_eq!(store.list_all("/ws", true).unwrap().len(), 1);
    }

    #[test]
    fn alias_collision_within_type_keeps_first() {
        let store = FileRegistryStore::open_in_memory().unwrap();
        let a = entry("uploads/a.csv");
        let b = entry("uploads/b.csv");
        store.upsert_file(&a).unwrap();
        store.upsert_file(&b).unwrap();

        store.add_alias("al1", &a.id, "display_name", "report").unwrap();
        store.add_alias("al2", &b.id, "display_name", "report").unwrap();

        let found = store.find_by_alias("report").unwrap().unwrap();
        assert_eq!(found.id, a.id);
        // different alias_type may reuse the value
        store.add_alias("al3", &b.id, "cow_path", "report").unwrap();
        assert_eq!(store.aliases_for_file(&b.id).unwrap().len(), 1);
    }

    #[test]
    fn soft_delete_keeps_row() {
        let store = FileRegistryStore::open_in_memory().unwrap();
        let e = entry("uploads/a.csv");
        store.upsert_file(&e).unwrap();
        store.soft_delete("/ws", "uploads/a.csv", &now_iso()).unwrap();

        assert!(store.list_all("/ws", false).unwrap().is_empty());
        assert_eq!(store.list_all("/ws", true).unwrap().len(), 1);
    }

    #[test]
    fn events_are_ordered_per_file() {
        let store = FileRegistryStore::open_in_memory().unwrap();
        let e = entry("uploads/a.csv");
        store.upsert_file(&e).unwrap();
        for (i, event_type) in ["uploaded", "modified"].iter().enumerate() {
            store
                .add_event(&FileEvent {
                    id: format!("ev{}", i),
                    file_id: e.id.clone(),
                    event_type: event_type.to_string(),
                    session_id: Some("s1".to_string()),
                    turn: Some(i),
                    tool_name: None,
                    details: serde_json::json!({"n": i}),
                    created_at: format!("2026-01-0{}T00:00:00Z", i + 1),
                })
                .unwrap();
        }
        let events = store.get_events(&e.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "uploaded");
        assert_eq!(events[1].turn, Some(1));
    }

    #[test]
    fn children_query_follows_parent_id() {
        let store = FileRegistryStore::open_in_memory().unwrap();
        let parent = entry("uploads/a.csv");
        store.upsert_file(&parent).unwrap();
        let mut child = entry("outputs/backups/a_copy.csv");
        child.parent_file_id = Some(parent.id.clone());
        store.upsert_file(&child).unwrap();

        let children = store.get_children(&parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].canonical_path, "outputs/backups/a_copy.csv");
    }
}
