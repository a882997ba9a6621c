//! Workbook and CSV structure scanning.
//!
//! Workbooks open read-only through calamine; CSV files get their
//! encoding sniffed (UTF-8 first, then GB18030, then Windows-1252) and
//! a bounded number of rows sampled. The header row is detected by
//! scoring candidate rows: textual, densely filled rows win.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use super::entry::SheetMeta;
use crate::events::CellChange;

const MAX_HEADER_COLUMNS: usize = 30;
const MAX_DIFF_ROWS: usize = 200;
const MAX_DIFF_CHANGES: usize = 50;

/// Per-sheet metadata for a workbook or CSV file.
pub fn scan_file_sheets(path: &Path, header_scan_rows: usize) -> anyhow::Result<Vec<SheetMeta>> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if ext == "csv" {
        return scan_csv(path, header_scan_rows);
    }
    scan_workbook(path, header_scan_rows)
}

fn scan_workbook(path: &Path, header_scan_rows: usize) -> anyhow::Result<Vec<SheetMeta>> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet_names = workbook.sheet_names().to_vec();
    let mut sheets = Vec::with_capacity(sheet_names.len());

    for name in sheet_names {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(err) => {
                log::debug!("failed to read sheet {}: {}", name, err);
                continue;
            }
        };
        let rows = range.height();
        let columns = range.width();

        let sample: Vec<Vec<String>> = range
            .rows()
            .take(header_scan_rows.min(rows))
            .map(|row| {
                row.iter()
                    .take(columns.min(MAX_HEADER_COLUMNS))
                    .map(cell_to_string)
                    .collect()
            })
            .collect();
        let headers = detect_headers(&sample, true);

        sheets.push(SheetMeta {
            name,
            rows,
            columns,
            headers,
        });
    }
    Ok(sheets)
}

fn scan_csv(path: &Path, header_scan_rows: usize) -> anyhow::Result<Vec<SheetMeta>> {
    let text = read_csv_text(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows_raw: Vec<Vec<String>> = Vec::new();
    let mut total_rows = 0usize;
    let mut total_cols = 0usize;
    for record in reader.records() {
        let record = record?;
        total_rows += 1;
        total_cols = total_cols.max(record.len());
        if rows_raw.len() <= header_scan_rows {
            rows_raw.push(record.iter().map(|s| s.to_string()).collect());
        }
    }

    let headers = detect_headers(&rows_raw, false);
    Ok(vec![SheetMeta {
        name: "Sheet1".to_string(),
        rows: total_rows,
        columns: total_cols,
        headers,
    }])
}

/// Decode CSV bytes: UTF-8 when valid, otherwise GB18030 and
/// Windows-1252 in that order.
fn read_csv_text(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)?;
    if let Ok(text) = std::str::from_utf8(&bytes) {
        // strip a UTF-8 BOM if present
        return Ok(text.trim_start_matches('\u{feff}').to_string());
    }
    for encoding in [encoding_rs::GB18030, encoding_rs::WINDOWS_1252] {
        let (decoded, _, had_errors) = encoding.decode(&bytes);
        if !had_errors {
            return Ok(decoded.into_owned());
        }
    }
    // last resort: lossy UTF-8
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Pick the best header row from the sampled rows. Workbook scoring
/// weights string cells; CSV scoring only counts non-empty cells.
fn detect_headers(rows: &[Vec<String>], weight_strings: bool) -> Vec<String> {
    let mut best_idx = 0usize;
    let mut best_score = -1i64;
    for (idx, row) in rows.iter().enumerate() {
        let non_empty: Vec<&String> = row.iter().filter(|v| !v.trim().is_empty()).collect();
        let score = if weight_strings {
            let string_count = non_empty
                .iter()
                .filter(|v| v.parse::<f64>().is_err())
                .count() as i64;
            string_count * 2 + non_empty.len() as i64
        } else {
            non_empty.len() as i64 * 2
        };
        if score > best_score {
            best_score = score;
            best_idx = idx;
        }
    }
    rows.get(best_idx)
        .map(|row| {
            row.iter()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

// ── grid reading and diffing for excel_diff events ──────────────

/// First sheet of the file as a bounded string grid. Missing or
/// unreadable files come back as an empty grid.
pub fn read_grid(path: &Path) -> Vec<Vec<String>> {
    if !path.is_file() {
        return Vec::new();
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if ext == "csv" {
        let Ok(text) = read_csv_text(path) else {
            return Vec::new();
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());
        return reader
            .records()
            .take(MAX_DIFF_ROWS)
            .filter_map(|r| r.ok())
            .map(|record| record.iter().map(|s| s.to_string()).collect())
            .collect();
    }

    let Ok(mut workbook) = open_workbook_auto(path) else {
        return Vec::new();
    };
    let Some(name) = workbook.sheet_names().first().cloned() else {
        return Vec::new();
    };
    let Ok(range) = workbook.worksheet_range(&name) else {
        return Vec::new();
    };
    range
        .rows()
        .take(MAX_DIFF_ROWS)
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect()
}

/// Sheet name of the first sheet, for diff event labeling.
pub fn first_sheet_name(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if ext == "csv" {
        return "Sheet1".to_string();
    }
    open_workbook_auto(path)
        .ok()
        .and_then(|wb| wb.sheet_names().first().cloned())
        .unwrap_or_else(|| "Sheet1".to_string())
}

/// A1-style cell reference from zero-based row/column indices.
pub fn cell_name(row: usize, col: usize) -> String {
    let mut col_name = String::new();
    let mut c = col;
    loop {
        col_name.insert(0, (b'A' + (c % 26) as u8) as char);
        if c < 26 {
            break;
        }
        c = c / 26 - 1;
    }
    format!("{}{}", col_name, row + 1)
}

/// Cell-level deltas between two grids, capped at [`MAX_DIFF_CHANGES`].
/// Returns the change list plus the affected A1 range.
pub fn diff_grids(before: &[Vec<String>], after: &[Vec<String>]) -> (Vec<CellChange>, String) {
    let mut changes = Vec::new();
    let rows = before.len().max(after.len());
    let mut min_row = usize::MAX;
    let mut max_row = 0usize;
    let mut min_col = usize::MAX;
    let mut max_col = 0usize;

    'outer: for r in 0..rows {
        let empty: Vec<String> = Vec::new();
        let row_before = before.get(r).unwrap_or(&empty);
        let row_after = after.get(r).unwrap_or(&empty);
        let cols = row_before.len().max(row_after.len());
        for c in 0..cols {
            let old = row_before.get(c).map(String::as_str).unwrap_or("");
            let new = row_after.get(c).map(String::as_str).unwrap_or("");
            if old != new {
                min_row = min_row.min(r);
                max_row = max_row.max(r);
                min_col = min_col.min(c);
                max_col = max_col.max(c);
                changes.push(CellChange {
                    cell: cell_name(r, c),
                    old: old.to_string(),
                    new: new.to_string(),
                });
                if changes.len() >= MAX_DIFF_CHANGES {
                    break 'outer;
                }
            }
        }
    }

    let affected_range = if changes.is_empty() {
        String::new()
    } else {
        format!(
            "{}:{}",
            cell_name(min_row, min_col),
            cell_name(max_row, max_col)
        )
    };
    (changes, affected_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn csv_scan_reports_shape_and_headers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "name,age,city\nalice,30,berlin\nbob,25,tokyo\n").unwrap();

        let sheets = scan_file_sheets(&path, 5).unwrap();
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].name, "Sheet1");
        assert_eq!(sheets[0].rows, 3);
        assert_eq!(sheets[0].columns, 3);
        assert_eq!(sheets[0].headers, vec!["name", "age", "city"]);
    }

    #[test]
    fn csv_with_bom_is_decoded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bom.csv");
        fs::write(&path, "\u{feff}a,b\n1,2\n").unwrap();
        let sheets = scan_file_sheets(&path, 5).unwrap();
        assert_eq!(sheets[0].headers, vec!["a", "b"]);
    }

    #[test]
    fn csv_gbk_bytes_are_sniffed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gbk.csv");
        // "名称" in GB18030 followed by an ASCII column
        let (encoded, _, _) = encoding_rs::GB18030.encode("名称,值\nx,1\n");
        fs::write(&path, encoded.as_ref()).unwrap();
        let sheets = scan_file_sheets(&path, 5).unwrap();
        assert_eq!(sheets[0].headers[0], "名称");
    }

    #[test]
    fn cell_names_follow_a1_convention() {
        assert_eq!(cell_name(0, 0), "A1");
        assert_eq!(cell_name(1, 1), "B2");
        assert_eq!(cell_name(0, 25), "Z1");
        assert_eq!(cell_name(0, 26), "AA1");
        assert_eq!(cell_name(9, 27), "AB10");
    }

    #[test]
    fn diff_reports_changed_cells_and_range() {
        let before = vec![
            vec!["1".to_string(), "2".to_string()],
            vec!["3".to_string(), "4".to_string()],
        ];
        let after = vec![
            vec!["1".to_string(), "42".to_string()],
            vec!["3".to_string(), "4".to_string(), "5".to_string()],
        ];
        let (changes, range) = diff_grids(&before, &after);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].cell, "B1");
        assert_eq!(changes[0].old, "2");
        assert_eq!(changes[0].new, "42");
        assert_eq!(changes[1].cell, "C2");
        assert_eq!(range, "B1:C2");
    }

    #[test]
    fn diff_of_identical_grids_is_empty() {
        let grid = vec![vec!["x".to_string()]];
        let (changes, range) = diff_grids(&grid, &grid);
        assert!(changes.is_empty());
        assert!(range.is_empty());
    }

    #[test]
    fn read_grid_on_missing_file_is_empty() {
        assert!(read_grid(Path::new("/nonexistent.csv")).is_empty());
    }

    #[test]
    fn header_detection_prefers_textual_rows() {
        let rows = vec![
            vec!["".to_string(), "".to_string()],
            vec!["name".to_string(), "value".to_string()],
        ];
        assert_eq!(detect_headers(&rows, true), vec!["name", "value"]);
    }
}
