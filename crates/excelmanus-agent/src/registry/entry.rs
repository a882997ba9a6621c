//! File registry records.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Spreadsheet-family extensions.
pub const EXCEL_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb", "csv"];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "svg"];
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "json", "xml", "yaml", "yml", "log"];

/// Noise directories skipped by workspace scans.
pub const SKIP_DIRS: &[&str] = &[
    ".git", ".venv", "node_modules", "__pycache__", ".worktrees", "dist", "build",
];

/// Compiled/binary extensions skipped by full scans.
pub const SKIP_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "so", "dylib", "dll", "exe",
    "o", "a", "class", "jar", "war",
    "whl", "egg", "tar", "gz", "bz2", "xz", "zst",
    "db", "sqlite", "sqlite3",
    "woff", "woff2", "ttf", "otf", "eot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Excel,
    Csv,
    Image,
    Text,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Excel => "excel",
            FileType::Csv => "csv",
            FileType::Image => "image",
            FileType::Text => "text",
            FileType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "excel" => FileType::Excel,
            "csv" => FileType::Csv,
            "image" => FileType::Image,
            "text" => FileType::Text,
            _ => FileType::Other,
        }
    }
}

/// How a file came to exist in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOrigin {
    Uploaded,
    Scan,
    AgentCreated,
    Backup,
    CowCopy,
}

impl FileOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOrigin::Uploaded => "uploaded",
            FileOrigin::Scan => "scan",
            FileOrigin::AgentCreated => "agent_created",
            FileOrigin::Backup => "backup",
            FileOrigin::CowCopy => "cow_copy",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "uploaded" => FileOrigin::Uploaded,
            "agent_created" => FileOrigin::AgentCreated,
            "backup" => FileOrigin::Backup,
            "cow_copy" => FileOrigin::CowCopy,
            _ => FileOrigin::Scan,
        }
    }
}

/// Per-sheet metadata captured during workbook scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SheetMeta {
    pub name: String,
    pub rows: usize,
    pub columns: usize,
    pub headers: Vec<String>,
}

/// Logical record for any file known to the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub workspace: String,
    pub canonical_path: String,
    pub original_name: String,
    pub file_type: FileType,
    pub size_bytes: u64,
    pub origin: FileOrigin,
    pub origin_session_id: Option<String>,
    pub origin_turn: Option<usize>,
    pub origin_tool: Option<String>,
    pub parent_file_id: Option<String>,
    pub sheet_meta: Vec<SheetMeta>,
    pub content_hash: String,
    pub mtime_ns: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl FileEntry {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A file lifecycle event (provenance record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    pub id: String,
    pub file_id: String,
    pub event_type: String,
    pub session_id: Option<String>,
    pub turn: Option<usize>,
    pub tool_name: Option<String>,
    pub details: serde_json::Value,
    pub created_at: String,
}

/// Outcome summary of a workspace scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub total_files: usize,
    pub new_files: usize,
    pub updated_files: usize,
    pub deleted_files: usize,
    pub cache_hits: usize,
    pub scan_duration_ms: u64,
}

pub fn detect_file_type(path: &str) -> FileType {
    let ext = std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if ext == "csv" {
        return FileType::Csv;
    }
    if EXCEL_EXTENSIONS.contains(&ext.as_str()) {
        return FileType::Excel;
    }
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return FileType::Image;
    }
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return FileType::Text;
    }
    FileType::Other
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_detection() {
        assert_eq!(detect_file_type("a/b/report.xlsx"), FileType::Excel);
        assert_eq!(detect_file_type("data.CSV"), FileType::Csv);
        assert_eq!(detect_file_type("chart.png"), FileType::Image);
        assert_eq!(detect_file_type("notes.md"), FileType::Text);
        assert_eq!(detect_file_type("binary.bin"), FileType::Other);
        assert_eq!(detect_file_type("noext"), FileType::Other);
    }

    #[test]
    fn origin_round_trips_through_strings() {
        for origin in [
            FileOrigin::Uploaded,
            FileOrigin::Scan,
            FileOrigin::AgentCreated,
            FileOrigin::Backup,
            FileOrigin::CowCopy,
        ] {
            assert_eq!(FileOrigin::parse(origin.as_str()), origin);
        }
    }

    #[test]
    fn ids_are_sixteen_hex_chars() {
        let id = new_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
