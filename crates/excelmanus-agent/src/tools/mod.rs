//! Tool definitions and the per-session tool registry.

pub mod builtins;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::policy::SandboxRunner;
use crate::registry::FileRegistry;
use crate::session::WriteHint;
use crate::workspace::{IsolatedWorkspace, WorkspaceError, WorkspaceTransaction};

/// Declared filesystem effect of a tool; drives write hints, audit
/// requirements and the finish-task guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteEffect {
    #[default]
    None,
    WorkspaceWrite,
    WorkspaceDestructive,
}

impl WriteEffect {
    pub fn write_hint(&self) -> WriteHint {
        match self {
            WriteEffect::None => WriteHint::ReadOnly,
            WriteEffect::WorkspaceWrite | WriteEffect::WorkspaceDestructive => WriteHint::MayWrite,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidRequest(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Runtime(String),
}

impl From<WorkspaceError> for ToolError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::OutsideWorkspace { .. } => ToolError::PermissionDenied(err.to_string()),
            other => ToolError::Runtime(other.to_string()),
        }
    }
}

/// Execution context handed to every tool call. Carries the session's
/// transaction so reads see staged content and writes go to staged
/// copies, plus the registry for alias resolution and provenance.
pub struct ToolContext {
    pub session_id: String,
    pub turn: usize,
    pub workspace: Arc<IsolatedWorkspace>,
    pub registry: Arc<FileRegistry>,
    pub transaction: WorkspaceTransaction,
    pub transaction_enabled: bool,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub code_timeout: std::time::Duration,
    pub protected_dirs: Vec<String>,
}

impl ToolContext {
    /// Resolve a user/LLM-supplied path or alias for reading: alias →
    /// canonical, then staged redirection.
    pub fn resolve_read(&self, path_or_alias: &str) -> Result<PathBuf, ToolError> {
        let canonical = self.registry.resolve_for_tool(path_or_alias);
        Ok(self.transaction.resolve_read(&canonical)?)
    }

    /// Resolve a path for writing: alias → canonical, then staged copy
    /// (or the canonical path itself when transactions are disabled).
    /// The staged copy is also registered as backup metadata.
    pub fn resolve_write(&self, path_or_alias: &str) -> Result<PathBuf, ToolError> {
        let canonical = self.registry.resolve_for_tool(path_or_alias);
        if !self.transaction_enabled {
            return Ok(crate::workspace::resolve_in_workspace(
                &canonical,
                self.transaction.workspace_root(),
            )?);
        }
        Ok(self.registry.stage_for_write(
            &canonical,
            self.transaction.tx_id(),
            self.transaction.scope(),
        )?)
    }
}

/// A named, schema-typed operation callable from the LLM.
#[async_trait]
pub trait WorkspaceTool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> excelmanus::chat::Tool;

    fn write_effect(&self) -> WriteEffect {
        WriteEffect::None
    }

    /// Result truncation bound.
    fn max_result_chars(&self) -> usize {
        8_000
    }

    /// Scope label used by skill packs to select tool subsets.
    fn scope(&self) -> &str {
        "core"
    }

    async fn call(&self, args: &Map<String, Value>, context: &ToolContext)
        -> Result<String, ToolError>;
}

/// Engine-routed tool: offered to the LLM but executed by a dispatcher
/// handler, not through [`WorkspaceTool::call`].
#[derive(Clone)]
pub struct VirtualTool {
    pub definition: excelmanus::chat::Tool,
    pub write_effect: WriteEffect,
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn WorkspaceTool>>,
    virtuals: HashMap<String, VirtualTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tool: Arc<dyn WorkspaceTool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn add_virtual(&mut self, virtual_tool: VirtualTool) -> &mut Self {
        self.virtuals
            .insert(virtual_tool.definition.function.name.clone(), virtual_tool);
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn WorkspaceTool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name) || self.virtuals.contains_key(name)
    }

    /// Schema definitions for every tool, optionally filtered to a
    /// scope list (skill packs restrict by scope label).
    pub fn definitions(&self, scope_filter: Option<&[String]>) -> Vec<excelmanus::chat::Tool> {
        let in_scope = |name: &str, scope: &str| match scope_filter {
            None => true,
            Some(scopes) => {
                scopes.iter().any(|s| s == scope) || scopes.iter().any(|s| s == name)
            }
        };
        let mut defs: Vec<excelmanus::chat::Tool> = self
            .tools
            .values()
            .filter(|t| in_scope(t.name(), t.scope()))
            .map(|t| t.definition())
            .collect();
        defs.extend(
            self.virtuals
                .values()
                .filter(|v| in_scope(&v.definition.function.name, "core"))
                .map(|v| v.definition.clone()),
        );
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Declared write effect; `None` for tools the registry does not
    /// know (external/MCP tools get the unknown write hint upstream).
    pub fn write_effect(&self, name: &str) -> Option<WriteEffect> {
        if let Some(tool) = self.tools.get(name) {
            return Some(tool.write_effect());
        }
        self.virtuals.get(name).map(|v| v.write_effect)
    }

    pub fn max_result_chars(&self, name: &str) -> usize {
        self.tools
            .get(name)
            .map(|t| t.max_result_chars())
            .unwrap_or(8_000)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .keys()
            .chain(self.virtuals.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Bound the result string; overlong output gets a truncation marker.
pub fn truncate_result(result: &str, max_chars: usize) -> String {
    if result.len() <= max_chars {
        return result.to_string();
    }
    let cut = (0..=max_chars).rev().find(|&i| result.is_char_boundary(i)).unwrap_or(0);
    format!(
        "{}\n... [result truncated at {} chars]",
        &result[..cut],
        max_chars
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl WorkspaceTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn definition(&self) -> excelmanus::chat::Tool {
            excelmanus::chat::Tool::function("echo", "Echo the input", json!({"type": "object"}))
        }
        fn write_effect(&self) -> WriteEffect {
            WriteEffect::WorkspaceWrite
        }
        async fn call(
            &self,
            _args: &Map<String, Value>,
            _context: &ToolContext,
        ) -> Result<String, ToolError> {
            Ok("echo".to_string())
        }
    }

    #[test]
    fn registry_reports_write_effects() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool));
        registry.add_virtual(VirtualTool {
            definition: excelmanus::chat::Tool::function(
                "finish_task",
                "Finish",
                json!({"type": "object"}),
            ),
            write_effect: WriteEffect::None,
        });

        assert_eq!(registry.write_effect("echo"), Some(WriteEffect::WorkspaceWrite));
        assert_eq!(registry.write_effect("finish_task"), Some(WriteEffect::None));
        assert_eq!(registry.write_effect("mystery"), None);
        assert!(registry.contains("finish_task"));
        assert!(registry.find("finish_task").is_none());
    }

    #[test]
    fn definitions_include_virtual_tools() {
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(EchoTool));
        registry.add_virtual(VirtualTool {
            definition: excelmanus::chat::Tool::function(
                "ask_user",
                "Ask",
                json!({"type": "object"}),
            ),
            write_effect: WriteEffect::None,
        });
        let names: Vec<String> = registry
            .definitions(None)
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names, vec!["ask_user", "echo"]);
    }

    #[test]
    fn write_effect_maps_to_hint() {
        use crate::session::WriteHint;
        assert_eq!(WriteEffect::None.write_hint(), WriteHint::ReadOnly);
        assert_eq!(WriteEffect::WorkspaceWrite.write_hint(), WriteHint::MayWrite);
        assert_eq!(
            WriteEffect::WorkspaceDestructive.write_hint(),
            WriteHint::MayWrite
        );
    }

    #[test]
    fn truncation_appends_marker() {
        let long = "x".repeat(100);
        let truncated = truncate_result(&long, 50);
        assert!(truncated.contains("[result truncated at 50 chars]"));
        assert!(truncated.starts_with(&"x".repeat(50)));
        assert_eq!(truncate_result("short", 50), "short");
    }
}
