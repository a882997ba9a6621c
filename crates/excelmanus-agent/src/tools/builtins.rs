//! Built-in workspace tools plus the engine-routed tool definitions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use excelmanus::chat::Tool as ToolSchema;

use crate::policy::sandbox::CodeRunRequest;
use crate::policy::RiskTier;
use crate::registry::sheets;
use crate::workspace::to_workspace_relative;

use super::{ToolContext, ToolError, ToolRegistry, VirtualTool, WorkspaceTool, WriteEffect};

/// Registry with every built-in tool and the engine-routed
/// definitions registered.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.add(Arc::new(ListFilesTool));
    registry.add(Arc::new(ReadCellsTool));
    registry.add(Arc::new(WriteCellsTool));
    registry.add(Arc::new(RunCodeTool));
    for virtual_tool in interceptor_tools() {
        registry.add_virtual(virtual_tool);
    }
    registry
}

/// Parse an A1-style reference into zero-based (row, column).
pub fn parse_cell_ref(cell: &str) -> Option<(usize, usize)> {
    let cell = cell.trim().to_uppercase();
    let split = cell.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cell.split_at(split);
    if letters.is_empty() || digits.is_empty() {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        col = col * 26 + (c as usize - 'A' as usize + 1);
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col - 1))
}

// ── list_files ──────────────────────────────────────────────────

pub struct ListFilesTool;

#[async_trait]
impl WorkspaceTool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema::function(
            self.name(),
            "List the files known to the workspace with their types and sheet structure.",
            json!({
                "type": "object",
                "properties": {
                    "include_backups": {
                        "type": "boolean",
                        "description": "Include backup/CoW copies.",
                        "default": false
                    }
                }
            }),
        )
    }

    async fn call(
        &self,
        args: &Map<String, Value>,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let include_backups = args
            .get("include_backups")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let entries = context.registry.list_all(false);
        let files: Vec<Value> = entries
            .iter()
            .filter(|e| {
                include_backups
                    || !matches!(
                        e.origin,
                        crate::registry::FileOrigin::Backup | crate::registry::FileOrigin::CowCopy
                    )
            })
            .map(|e| {
                json!({
                    "path": e.canonical_path,
                    "name": e.original_name,
                    "type": e.file_type.as_str(),
                    "size_bytes": e.size_bytes,
                    "sheets": e.sheet_meta.iter().map(|s| json!({
                        "name": s.name, "rows": s.rows, "columns": s.columns,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::to_string(&json!({"files": files}))
            .map_err(|e| ToolError::Runtime(e.to_string()))
    }
}

// ── read_cells ──────────────────────────────────────────────────

pub struct ReadCellsTool;

#[async_trait]
impl WorkspaceTool for ReadCellsTool {
    fn name(&self) -> &str {
        "read_cells"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema::function(
            self.name(),
            "Read cell values from a spreadsheet file (first sheet). Returns a bounded grid.",
            json!({
                "type": "object",
                "properties": {
                    "file": {"type": "string", "description": "Workbook/CSV path or display name."},
                    "max_rows": {"type": "integer", "description": "Row cap.", "default": 50}
                },
                "required": ["file"]
            }),
        )
    }

    async fn call(
        &self,
        args: &Map<String, Value>,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let file = args
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("file is required".to_string()))?;
        let max_rows = args
            .get("max_rows")
            .and_then(Value::as_u64)
            .unwrap_or(50)
            .min(500) as usize;

        let path = context.resolve_read(file)?;
        if !path.is_file() {
            return Err(ToolError::Runtime(format!("file not found: {}", file)));
        }
        let grid = sheets::read_grid(&path);
        let rows: Vec<&[String]> = grid.iter().take(max_rows).map(|r| r.as_slice()).collect();
        serde_json::to_string(&json!({
            "file": file,
            "sheet": sheets::first_sheet_name(&path),
            "rows": rows,
            "total_rows": grid.len(),
        }))
        .map_err(|e| ToolError::Runtime(e.to_string()))
    }
}

// ── write_cells ─────────────────────────────────────────────────

pub struct WriteCellsTool;

#[async_trait]
impl WorkspaceTool for WriteCellsTool {
    fn name(&self) -> &str {
        "write_cells"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema::function(
            self.name(),
            "Write a value into a cell of a CSV file. The write lands in the staged copy; \
             workbook (.xlsx) edits go through run_code instead.",
            json!({
                "type": "object",
                "properties": {
                    "file": {"type": "string", "description": "CSV path or display name."},
                    "cell": {"type": "string", "description": "A1-style cell reference."},
                    "value": {"type": "string", "description": "Value to write."}
                },
                "required": ["file", "cell", "value"]
            }),
        )
    }

    fn write_effect(&self) -> WriteEffect {
        WriteEffect::WorkspaceWrite
    }

    async fn call(
        &self,
        args: &Map<String, Value>,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let file = args
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("file is required".to_string()))?;
        let cell = args
            .get("cell")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("cell is required".to_string()))?;
        let value = match args.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(ToolError::InvalidRequest("value is required".to_string())),
        };

        let canonical = context.registry.resolve_for_tool(file);
        if !canonical.to_lowercase().ends_with(".csv") {
            return Err(ToolError::Runtime(format!(
                "write_cells supports CSV files; use run_code to edit {}",
                canonical
            )));
        }
        let (row, col) = parse_cell_ref(cell)
            .ok_or_else(|| ToolError::InvalidRequest(format!("bad cell reference: {}", cell)))?;

        let target = context.resolve_write(&canonical)?;

        // load existing rows (an absent file starts empty)
        let mut grid: Vec<Vec<String>> = if target.is_file() {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(&target)
                .map_err(|e| ToolError::Runtime(e.to_string()))?;
            reader
                .records()
                .filter_map(|r| r.ok())
                .map(|record| record.iter().map(|s| s.to_string()).collect())
                .collect()
        } else {
            Vec::new()
        };

        while grid.len() <= row {
            grid.push(Vec::new());
        }
        while grid[row].len() <= col {
            grid[row].push(String::new());
        }
        grid[row][col] = value.clone();

        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(&target)
            .map_err(|e| ToolError::Runtime(e.to_string()))?;
        for record in &grid {
            // padded rows must still produce a line
            if record.is_empty() {
                writer
                    .write_record([""])
                    .map_err(|e| ToolError::Runtime(e.to_string()))?;
            } else {
                writer
                    .write_record(record)
                    .map_err(|e| ToolError::Runtime(e.to_string()))?;
            }
        }
        writer
            .flush()
            .map_err(|e| ToolError::Runtime(e.to_string()))?;

        serde_json::to_string(&json!({
            "file": canonical.clone(),
            "cell": cell.to_uppercase(),
            "value": value,
            "staged_path": target.to_string_lossy(),
            "changed_files": [canonical],
        }))
        .map_err(|e| ToolError::Runtime(e.to_string()))
    }
}

// ── run_code ────────────────────────────────────────────────────

/// Executes a Python snippet under the sandbox env contract. The code
/// policy handler routes here after classification with the tier in
/// `sandbox_tier`; the approval path executes RED code the same way.
pub struct RunCodeTool;

#[async_trait]
impl WorkspaceTool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn definition(&self) -> ToolSchema {
        ToolSchema::function(
            self.name(),
            "Run a Python snippet in the sandbox. Writes are redirected to staged copies; \
             protected files are copied on write.",
            json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Python source to execute."}
                },
                "required": ["code"]
            }),
        )
    }

    fn write_effect(&self) -> WriteEffect {
        WriteEffect::WorkspaceWrite
    }

    fn max_result_chars(&self) -> usize {
        12_000
    }

    async fn call(
        &self,
        args: &Map<String, Value>,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("code is required".to_string()))?;
        let tier = match args.get("sandbox_tier").and_then(Value::as_str) {
            Some("GREEN") => RiskTier::Green,
            Some("YELLOW") => RiskTier::Yellow,
            Some("RED") => RiskTier::Red,
            // unclassified direct calls run with the strictest guard
            _ => RiskTier::Green,
        };

        let env = context
            .workspace
            .create_sandbox_env(Some(context.transaction.clone()));
        let cow_log_path = env.cow_log_path()?;
        let request = CodeRunRequest {
            code: code.to_string(),
            tier,
            workspace_root: context.workspace.root_dir().to_path_buf(),
            tmp_dir: env.tmp_dir()?,
            staging_map_json: env.staging_map_json(),
            protected_dirs: context.protected_dirs.clone(),
            cow_log_path: cow_log_path.clone(),
            timeout: context.code_timeout,
        };

        let output = context
            .sandbox
            .run(&request)
            .await
            .map_err(ToolError::Runtime)?;

        // merge subprocess CoW events back into the transaction; the
        // log reports workspace-relative pairs
        if !output.cow_mapping.is_empty() {
            let relative: std::collections::HashMap<String, String> = output
                .cow_mapping
                .iter()
                .map(|(src, dst)| {
                    (
                        to_workspace_relative(
                            std::path::Path::new(src),
                            context.workspace.root_dir(),
                        ),
                        to_workspace_relative(
                            std::path::Path::new(dst),
                            context.workspace.root_dir(),
                        ),
                    )
                })
                .collect();
            // the registry path covers both the version layer and the
            // catalog metadata (shared FVM with the transaction)
            for (src, dst) in &relative {
                context.registry.register_cow_mapping(src, dst);
            }
        }
        let _ = std::fs::remove_file(&cow_log_path);

        Ok(output.to_result_json())
    }
}

// ── engine-routed definitions ───────────────────────────────────

/// Definitions for the tools the dispatcher intercepts before the
/// registry: they are offered to the LLM but never executed through
/// [`WorkspaceTool::call`].
pub fn interceptor_tools() -> Vec<VirtualTool> {
    let mut tools = Vec::new();

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "finish_task",
            "Declare the task complete with a structured report. Call only when the user's \
             request has been fully handled.",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "What was accomplished."},
                    "report": {
                        "type": "object",
                        "description": "Structured completion report.",
                        "properties": {
                            "operations": {"type": "string"},
                            "affected_files": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                }
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "ask_user",
            "Ask the user a structured question and wait for the answer. Blocks until the \
             user responds or the wait times out.",
            json!({
                "type": "object",
                "properties": {
                    "header": {"type": "string", "description": "Short header label."},
                    "text": {"type": "string", "description": "The question to ask."},
                    "options": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": {"type": "string"},
                                "description": {"type": "string"}
                            },
                            "required": ["label"]
                        }
                    },
                    "multiSelect": {"type": "boolean", "default": false}
                },
                "required": ["text"]
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "suggest_mode_switch",
            "Suggest switching the session mode; the user picks between switching and staying.",
            json!({
                "type": "object",
                "properties": {
                    "target_mode": {"type": "string", "enum": ["write", "read", "plan"]},
                    "reason": {"type": "string"}
                },
                "required": ["target_mode"]
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "activate_skill",
            "Switch the active skill pack.",
            json!({
                "type": "object",
                "properties": {
                    "skill_name": {"type": "string"}
                },
                "required": ["skill_name"]
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "delegate",
            "Delegate a task to a specialized subagent. Provide `task` for a single task or \
             `tasks` for parallel fan-out.",
            json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string"},
                    "agent_name": {"type": "string"},
                    "file_paths": {"type": "array", "items": {"type": "string"}},
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "task": {"type": "string"},
                                "agent_name": {"type": "string"}
                            },
                            "required": ["task"]
                        }
                    }
                }
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "list_subagents",
            "List the available subagents and their specialties.",
            json!({"type": "object", "properties": {}}),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "parallel_delegate",
            "Run several subagent tasks concurrently and gather their results.",
            json!({
                "type": "object",
                "properties": {
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "task": {"type": "string"},
                                "agent_name": {"type": "string"}
                            },
                            "required": ["task"]
                        },
                        "minItems": 2
                    }
                },
                "required": ["tasks"]
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "task_create",
            "Create a task in the working plan.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "detail": {"type": "string"}
                },
                "required": ["title"]
            }),
        ),
        write_effect: WriteEffect::None,
    });

    tools.push(VirtualTool {
        definition: ToolSchema::function(
            "extract_table_spec",
            "Extract a structured table spec from a table image via the vision pipeline.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "output_path": {"type": "string", "default": "outputs/replica_spec.json"},
                    "skip_style": {"type": "boolean", "default": false}
                },
                "required": ["file_path"]
            }),
        ),
        write_effect: WriteEffect::WorkspaceWrite,
    });

    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_refs_parse_to_zero_based_coordinates() {
        assert_eq!(parse_cell_ref("A1"), Some((0, 0)));
        assert_eq!(parse_cell_ref("B3"), Some((2, 1)));
        assert_eq!(parse_cell_ref("z10"), Some((9, 25)));
        assert_eq!(parse_cell_ref("AA2"), Some((1, 26)));
        assert_eq!(parse_cell_ref(""), None);
        assert_eq!(parse_cell_ref("12"), None);
        assert_eq!(parse_cell_ref("A0"), None);
        assert_eq!(parse_cell_ref("A-1"), None);
    }

    #[test]
    fn interceptor_set_covers_engine_tools() {
        let names: Vec<String> = interceptor_tools()
            .into_iter()
            .map(|v| v.definition.function.name)
            .collect();
        for expected in [
            "finish_task",
            "ask_user",
            "suggest_mode_switch",
            "activate_skill",
            "delegate",
            "list_subagents",
            "parallel_delegate",
            "task_create",
            "extract_table_spec",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn default_registry_has_builtins_and_virtuals() {
        let registry = default_registry();
        assert!(registry.find("write_cells").is_some());
        assert!(registry.find("run_code").is_some());
        assert!(registry.contains("finish_task"));
        assert_eq!(
            registry.write_effect("write_cells"),
            Some(WriteEffect::WorkspaceWrite)
        );
    }
}
