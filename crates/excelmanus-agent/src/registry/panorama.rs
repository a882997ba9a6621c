//! Workspace file panorama for system-prompt injection.
//!
//! Three bands chosen by file count: a full table with per-sheet
//! details (≤20 files), a compact list (≤100), and directory statistics
//! beyond that.

use std::collections::HashMap;
use std::path::Path;

use super::entry::{FileEntry, FileOrigin, FileType};

const FULL_THRESHOLD: usize = 20;
const COMPACT_THRESHOLD: usize = 100;

/// Semantic labels for well-known directories.
fn dir_label(parent: &str) -> &'static str {
    let normalized = parent.replace('\\', "/");
    let normalized = normalized.trim_matches('/');
    for (prefix, label) in [
        ("outputs/backups", "backup copies"),
        ("uploads", "user uploads"),
        ("outputs", "agent outputs"),
    ] {
        if normalized == prefix || normalized.starts_with(&format!("{}/", prefix)) {
            return label;
        }
    }
    ""
}

/// Render the panorama for the given active entries. Empty input means
/// an empty panorama (no header noise in the prompt).
pub fn build_panorama(entries: &[FileEntry], resolve_parent_name: impl Fn(&str) -> String) -> String {
    let active: Vec<&FileEntry> = entries.iter().filter(|e| e.is_active()).collect();
    if active.is_empty() {
        return String::new();
    }

    let mut user_files: Vec<&FileEntry> = Vec::new();
    let mut backups: Vec<&FileEntry> = Vec::new();
    let mut agent_outputs: Vec<&FileEntry> = Vec::new();
    for entry in &active {
        match entry.origin {
            FileOrigin::Backup | FileOrigin::CowCopy => backups.push(entry),
            FileOrigin::AgentCreated => agent_outputs.push(entry),
            _ => user_files.push(entry),
        }
    }

    let total = active.len();
    let mut lines: Vec<String> = vec!["## Workspace file panorama".to_string()];

    if total <= FULL_THRESHOLD {
        panorama_full(&mut lines, &user_files, &backups, &agent_outputs, &resolve_parent_name);
    } else if total <= COMPACT_THRESHOLD {
        panorama_compact(&mut lines, &user_files, &backups, &agent_outputs, &resolve_parent_name);
    } else {
        panorama_summary(&mut lines, &user_files, &backups, &agent_outputs);
    }

    lines.push(String::new());
    lines.push(
        "Path rules: read/write operations use the Location column paths; show the user the \
         File column names."
            .to_string(),
    );
    lines.push("Backup copies are not writable directly; operate on the original file.".to_string());

    lines.join("\n")
}

fn location_of(entry: &FileEntry) -> String {
    let parent = Path::new(&entry.canonical_path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    if parent.is_empty() || parent == "." {
        "./".to_string()
    } else {
        format!("{}/", parent)
    }
}

fn format_origin(entry: &FileEntry) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(
        match entry.origin {
            FileOrigin::Uploaded => "upload",
            FileOrigin::Scan => "scan",
            FileOrigin::AgentCreated => "agent",
            FileOrigin::Backup => "backup",
            FileOrigin::CowCopy => "CoW",
        }
        .to_string(),
    );
    if let Some(turn) = entry.origin_turn {
        parts.push(format!("T{}", turn));
    }
    if let Some(tool) = &entry.origin_tool {
        parts.push(tool.clone());
    }
    format!("({})", parts.join(" "))
}

fn format_structure(entry: &FileEntry) -> String {
    if matches!(entry.file_type, FileType::Excel | FileType::Csv) && !entry.sheet_meta.is_empty() {
        let parts: Vec<String> = entry
            .sheet_meta
            .iter()
            .map(|s| format!("{}({}×{})", s.name, s.rows, s.columns))
            .collect();
        return format!("{} sheets: {}", entry.sheet_meta.len(), parts.join(", "));
    }
    if entry.file_type == FileType::Image {
        return format!("image {}", format_size(entry.size_bytes));
    }
    if entry.size_bytes > 0 {
        return format_size(entry.size_bytes);
    }
    entry.file_type.as_str().to_string()
}

fn format_size(size_bytes: u64) -> String {
    if size_bytes < 1024 {
        format!("{}B", size_bytes)
    } else if size_bytes < 1024 * 1024 {
        format!("{}KB", size_bytes / 1024)
    } else {
        format!("{:.1}MB", size_bytes as f64 / (1024.0 * 1024.0))
    }
}

fn panorama_full(
    lines: &mut Vec<String>,
    user_files: &[&FileEntry],
    backups: &[&FileEntry],
    agent_outputs: &[&FileEntry],
    resolve_parent_name: &impl Fn(&str) -> String,
) {
    if !user_files.is_empty() {
        lines.push(format!("\n### User files ({})", user_files.len()));
        lines.push("| File | Location | Origin | Structure |".to_string());
        lines.push("|---|---|---|---|".to_string());
        let mut sorted = user_files.to_vec();
        sorted.sort_by(|a, b| a.canonical_path.cmp(&b.canonical_path));
        for entry in sorted {
            lines.push(format!(
                "| {} | {} | {} | {} |",
                entry.original_name,
                location_of(entry),
                format_origin(entry),
                format_structure(entry)
            ));
        }
    }

    if !backups.is_empty() {
        lines.push(format!("\n### Backups and copies ({})", backups.len()));
        lines.push("| Copy | Original | Kind | Created by |".to_string());
        lines.push("|---|---|---|---|".to_string());
        let mut sorted = backups.to_vec();
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for entry in sorted {
            let parent = entry
                .parent_file_id
                .as_deref()
                .map(resolve_parent_name)
                .unwrap_or_else(|| "-".to_string());
            let kind = if entry.origin == FileOrigin::CowCopy {
                "CoW protection"
            } else {
                "transaction backup"
            };
            lines.push(format!(
                "| {} | {} | {} | {} |",
                entry.canonical_path,
                parent,
                kind,
                format_origin(entry)
            ));
        }
    }

    if !agent_outputs.is_empty() {
        lines.push(format!("\n### Agent outputs ({})", agent_outputs.len()));
        lines.push("| File | Location | Derived from | Created by |".to_string());
        lines.push("|---|---|---|---|".to_string());
        let mut sorted = agent_outputs.to_vec();
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for entry in sorted {
            let parent = entry
                .parent_file_id
                .as_deref()
                .map(resolve_parent_name)
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "| {} | {} | {} | {} |",
                entry.original_name,
                location_of(entry),
                parent,
                format_origin(entry)
            ));
        }
    }
}

fn panorama_compact(
    lines: &mut Vec<String>,
    user_files: &[&FileEntry],
    backups: &[&FileEntry],
    agent_outputs: &[&FileEntry],
    resolve_parent_name: &impl Fn(&str) -> String,
) {
    if !user_files.is_empty() {
        lines.push(format!("\n### User files ({})", user_files.len()));
        let mut sorted = user_files.to_vec();
        sorted.sort_by(|a, b| a.canonical_path.cmp(&b.canonical_path));
        for entry in sorted {
            let sheets = if entry.sheet_meta.is_empty() {
                String::new()
            } else {
                let names: Vec<&str> =
                    entry.sheet_meta.iter().map(|s| s.name.as_str()).collect();
                format!(" [{}]", names.join(", "))
            };
            lines.push(format!("- `{}`{}", entry.canonical_path, sheets));
        }
    }

    if !backups.is_empty() {
        lines.push(format!("\n### Backups and copies ({})", backups.len()));
        let mut sorted = backups.to_vec();
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for entry in sorted {
            let parent = entry
                .parent_file_id
                .as_deref()
                .map(resolve_parent_name)
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!("- `{}` ← {}", entry.canonical_path, parent));
        }
    }

    if !agent_outputs.is_empty() {
        lines.push(format!("\n### Agent outputs ({})", agent_outputs.len()));
        let mut sorted = agent_outputs.to_vec();
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for entry in sorted {
            lines.push(format!("- `{}`", entry.canonical_path));
        }
    }
}

fn panorama_summary(
    lines: &mut Vec<String>,
    user_files: &[&FileEntry],
    backups: &[&FileEntry],
    agent_outputs: &[&FileEntry],
) {
    lines.push(format!(
        "\n{} user files, {} backups/copies, {} agent outputs",
        user_files.len(),
        backups.len(),
        agent_outputs.len()
    ));

    let mut dir_counts: HashMap<String, usize> = HashMap::new();
    for entry in user_files {
        let parent = Path::new(&entry.canonical_path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        *dir_counts.entry(parent).or_insert(0) += 1;
    }
    if dir_counts.is_empty() {
        return;
    }

    let mut top: Vec<(String, usize)> = dir_counts.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top.truncate(10);

    lines.push("Hot directories:".to_string());
    for (dir, count) in top {
        let label = if dir.is_empty() || dir == "." {
            ""
        } else {
            dir_label(&dir)
        };
        let suffix = if label.is_empty() {
            String::new()
        } else {
            format!(" ({})", label)
        };
        let shown = if dir.is_empty() || dir == "." {
            "(root)".to_string()
        } else {
            dir
        };
        lines.push(format!("  - `{}/` ({} files){}", shown, count, suffix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::entry::{new_id, now_iso, SheetMeta};

    fn make_entry(path: &str, origin: FileOrigin, file_type: FileType) -> FileEntry {
        let now = now_iso();
        FileEntry {
            id: new_id(),
            workspace: "/ws".to_string(),
            canonical_path: path.to_string(),
            original_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_type,
            size_bytes: 2048,
            origin,
            origin_session_id: None,
            origin_turn: Some(1),
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
    fn empty_registry_renders_nothing() {
        assert_eq!(build_panorama(&[], |_| "-".to_string()), "");
    }

    #[test]
    fn small_workspace_gets_full_table_with_sheets() {
        let mut entry = make_entry("uploads/report.xlsx", FileOrigin::Uploaded, FileType::Excel);
        entry.sheet_meta = vec![SheetMeta {
            name: "Summary".to_string(),
            rows: 120,
            columns: 8,
            headers: vec!["a".to_string()],
        }];
        let panorama = build_panorama(&[entry], |_| "-".to_string());
        assert!(panorama.contains("### User files (1)"));
        assert!(panorama.contains("| File | Location | Origin | Structure |"));
        assert!(panorama.contains("Summary(120×8)"));
        assert!(panorama.contains("uploads/"));
    }

    #[test]
    fn medium_workspace_gets_compact_list() {
        let entries: Vec<FileEntry> = (0..30)
            .map(|i| {
                make_entry(
                    &format!("uploads/file{:02}.csv", i),
                    FileOrigin::Scan,
                    FileType::Csv,
                )
            })
            .collect();
        let panorama = build_panorama(&entries, |_| "-".to_string());
        assert!(panorama.contains("### User files (30)"));
        assert!(panorama.contains("- `uploads/file00.csv`"));
        assert!(!panorama.contains("| File |"));
    }

    #[test]
    fn large_workspace_gets_statistics_with_labels() {
        let entries: Vec<FileEntry> = (0..150)
            .map(|i| {
                make_entry(
                    &format!("uploads/file{:03}.csv", i),
                    FileOrigin::Scan,
                    FileType::Csv,
                )
            })
            .collect();
        let panorama = build_panorama(&entries, |_| "-".to_string());
        assert!(panorama.contains("150 user files"));
        assert!(panorama.contains("Hot directories:"));
        assert!(panorama.contains("user uploads"));
        assert!(!panorama.contains("- `uploads/file000.csv`"));
    }

    #[test]
    fn backups_are_grouped_separately() {
        let user = make_entry("uploads/a.csv", FileOrigin::Uploaded, FileType::Csv);
        let mut backup = make_entry(
            "outputs/backups/a_copy.csv",
            FileOrigin::Backup,
            FileType::Csv,
        );
        backup.parent_file_id = Some(user.id.clone());
        let panorama = build_panorama(&[user, backup], |_| "a.csv".to_string());
        assert!(panorama.contains("### Backups and copies (1)"));
        assert!(panorama.contains("transaction backup"));
        assert!(panorama.contains("a.csv"));
    }

    #[test]
    fn deleted_entries_are_excluded() {
        let mut entry = make_entry("uploads/a.csv", FileOrigin::Scan, FileType::Csv);
        entry.deleted_at = Some(now_iso());
        assert_eq!(build_panorama(&[entry], |_| "-".to_string()), "");
    }
}
