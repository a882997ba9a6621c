//! Tool routing.
//!
//! The dispatcher holds an ordered list of handler strategies; the
//! first whose predicate matches the tool name wins. Argument parsing
//! is shared by all handlers: failures become tool-result strings the
//! LLM can read and retry on, never exceptions.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};

use crate::approval::{ApprovalManager, AuditRecord};
use crate::workspace::quota::scan_usage;

/// Handler strategies in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    SkillActivation,
    Delegation,
    FinishTask,
    AskUser,
    SuggestModeSwitch,
    PlanIntercept,
    ExtractTableSpec,
    CodePolicy,
    AuditOnly,
    HighRiskApproval,
    Default,
}

/// Engine state the routing predicates consult.
pub struct RouteContext<'a> {
    pub plan_intercept_task_create: bool,
    pub code_policy_enabled: bool,
    pub approval: &'a ApprovalManager,
}

pub struct ToolDispatcher {
    order: Vec<HandlerKind>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self {
            order: vec![
                HandlerKind::SkillActivation,
                HandlerKind::Delegation,
                HandlerKind::FinishTask,
                HandlerKind::AskUser,
                HandlerKind::SuggestModeSwitch,
                HandlerKind::PlanIntercept,
                HandlerKind::ExtractTableSpec,
                HandlerKind::CodePolicy,
                HandlerKind::AuditOnly,
                HandlerKind::HighRiskApproval,
                HandlerKind::Default,
            ],
        }
    }
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// First handler whose predicate accepts the tool name.
    pub fn route(&self, context: &RouteContext<'_>, tool_name: &str) -> HandlerKind {
        for kind in &self.order {
            if Self::can_handle(*kind, context, tool_name) {
                return *kind;
            }
        }
        HandlerKind::Default
    }

    fn can_handle(kind: HandlerKind, context: &RouteContext<'_>, tool_name: &str) -> bool {
        match kind {
            HandlerKind::SkillActivation => tool_name == "activate_skill",
            HandlerKind::Delegation => matches!(
                tool_name,
                "delegate" | "delegate_to_subagent" | "list_subagents" | "parallel_delegate"
            ),
            HandlerKind::FinishTask => tool_name == "finish_task",
            HandlerKind::AskUser => tool_name == "ask_user",
            HandlerKind::SuggestModeSwitch => tool_name == "suggest_mode_switch",
            HandlerKind::PlanIntercept => {
                tool_name == "task_create" && context.plan_intercept_task_create
            }
            HandlerKind::ExtractTableSpec => tool_name == "extract_table_spec",
            HandlerKind::CodePolicy => tool_name == "run_code" && context.code_policy_enabled,
            HandlerKind::AuditOnly => context.approval.is_audit_only_tool(tool_name),
            HandlerKind::HighRiskApproval => context.approval.is_high_risk_tool(tool_name),
            HandlerKind::Default => true,
        }
    }
}

/// Result of executing one tool call through a handler.
#[derive(Debug, Clone, Default)]
pub struct ToolExecOutcome {
    pub result_str: String,
    pub success: bool,
    pub error: Option<String>,
    /// finish_task only: the finish gate accepted the completion.
    pub finish_accepted: bool,
    /// A high-risk approval is pending; the loop is suppressed until
    /// it resolves.
    pub pending_approval: bool,
    pub approval_id: Option<String>,
    /// Plan intercept: the tool result is deferred to the proposal
    /// resolution instead of being fed back immediately.
    pub defer_tool_result: bool,
    /// Workspace-relative paths the call modified.
    pub changed_files: Vec<String>,
    pub audit: Option<AuditRecord>,
}

impl ToolExecOutcome {
    pub fn ok(result_str: impl Into<String>) -> Self {
        Self {
            result_str: result_str.into(),
            success: true,
            ..Self::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            result_str: message.clone(),
            success: false,
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Normalize raw tool-call arguments into a JSON object.
///
/// Accepts an empty string, `null`, or a JSON object string. Arrays and
/// non-object values are rejected with a message the LLM can act on.
pub fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(Value::Array(_)) => Err("tool arguments must be a JSON object, got an array".to_string()),
        Ok(other) => Err(format!(
            "tool arguments must be a JSON object, got {}",
            json_type_name(&other)
        )),
        Err(err) => Err(format!("failed to parse tool arguments as JSON: {}", err)),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Pull the `changed_files` list a write tool reports in its JSON
/// result; non-JSON results yield nothing.
pub fn extract_changed_files(result_str: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(result_str) else {
        return Vec::new();
    };
    value
        .get("changed_files")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `true` when a run_code result carries a non-empty CoW mapping.
pub fn result_has_cow_mapping(result_str: &str) -> bool {
    serde_json::from_str::<Value>(result_str)
        .ok()
        .and_then(|v| v.get("cow_mapping").cloned())
        .and_then(|v| v.as_object().map(|m| !m.is_empty()))
        .unwrap_or(false)
}

/// Snapshot of user-visible file state, used to detect writes by tools
/// with an unknown write effect.
pub type WriteProbe = HashMap<String, (i64, u64)>;

pub fn capture_write_probe(workspace_root: &Path) -> WriteProbe {
    scan_usage(workspace_root)
        .into_iter()
        .map(|f| (f.path, (f.modified_at, f.size)))
        .collect()
}

/// Paths that appeared or changed between two probes.
pub fn diff_write_probe(before: &WriteProbe, after: &WriteProbe) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(path, stat)| before.get(*path) != Some(stat))
        .map(|(path, _)| path.clone())
        .collect();
    changed.sort();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str) -> HandlerKind {
        let approval = ApprovalManager::new();
        let context = RouteContext {
            plan_intercept_task_create: false,
            code_policy_enabled: true,
            approval: &approval,
        };
        ToolDispatcher::new().route(&context, name)
    }

    // ── routing ────────────────────────────────────────────────

    #[test]
    fn routing_follows_priority_order() {
        assert_eq!(route("activate_skill"), HandlerKind::SkillActivation);
        assert_eq!(route("delegate"), HandlerKind::Delegation);
        assert_eq!(route("parallel_delegate"), HandlerKind::Delegation);
        assert_eq!(route("finish_task"), HandlerKind::FinishTask);
        assert_eq!(route("ask_user"), HandlerKind::AskUser);
        assert_eq!(route("suggest_mode_switch"), HandlerKind::SuggestModeSwitch);
        assert_eq!(route("extract_table_spec"), HandlerKind::ExtractTableSpec);
        assert_eq!(route("run_code"), HandlerKind::CodePolicy);
        assert_eq!(route("write_cells"), HandlerKind::AuditOnly);
        assert_eq!(route("delete_file"), HandlerKind::HighRiskApproval);
        assert_eq!(route("read_cells"), HandlerKind::Default);
        assert_eq!(route("some_mcp_tool"), HandlerKind::Default);
    }

    #[test]
    fn task_create_routes_default_unless_plan_mode() {
        let approval = ApprovalManager::new();
        let mut context = RouteContext {
            plan_intercept_task_create: false,
            code_policy_enabled: true,
            approval: &approval,
        };
        let dispatcher = ToolDispatcher::new();
        assert_eq!(dispatcher.route(&context, "task_create"), HandlerKind::Default);
        context.plan_intercept_task_create = true;
        assert_eq!(
            dispatcher.route(&context, "task_create"),
            HandlerKind::PlanIntercept
        );
    }

    #[test]
    fn run_code_bypasses_policy_when_disabled() {
        let approval = ApprovalManager::new();
        let context = RouteContext {
            plan_intercept_task_create: false,
            code_policy_enabled: false,
            approval: &approval,
        };
        // falls through CodePolicy to AuditOnly (run_code is audited)
        assert_eq!(
            ToolDispatcher::new().route(&context, "run_code"),
            HandlerKind::AuditOnly
        );
    }

    // ── argument parsing ───────────────────────────────────────

    #[test]
    fn empty_and_null_arguments_become_empty_map() {
        assert!(parse_arguments("").unwrap().is_empty());
        assert!(parse_arguments("  ").unwrap().is_empty());
        assert!(parse_arguments("null").unwrap().is_empty());
    }

    #[test]
    fn object_arguments_parse() {
        let args = parse_arguments(r#"{"file": "a.csv", "cell": "A1"}"#).unwrap();
        assert_eq!(args.get("file").unwrap(), "a.csv");
    }

    #[test]
    fn array_arguments_are_rejected() {
        let err = parse_arguments(r#"[1, 2, 3]"#).unwrap_err();
        assert!(err.contains("array"));
    }

    #[test]
    fn scalar_arguments_are_rejected() {
        let err = parse_arguments("42").unwrap_err();
        assert!(err.contains("a number"));
        let err = parse_arguments(r#""text""#).unwrap_err();
        assert!(err.contains("a string"));
    }

    #[test]
    fn malformed_json_reports_parse_error() {
        let err = parse_arguments("{ not json").unwrap_err();
        assert!(err.contains("failed to parse"));
    }

    // ── result introspection ───────────────────────────────────

    #[test]
    fn changed_files_extracted_from_result_json() {
        let result = r#"{"cell": "A1", "changed_files": ["report.csv", "out.csv"]}"#;
        assert_eq!(
            extract_changed_files(result),
            vec!["report.csv".to_string(), "out.csv".to_string()]
        );
        assert!(extract_changed_files("plain text result").is_empty());
    }

    #[test]
    fn cow_mapping_detection() {
        assert!(result_has_cow_mapping(
            r#"{"exit_code": 0, "cow_mapping": {"a": "b"}}"#
        ));
        assert!(!result_has_cow_mapping(r#"{"cow_mapping": {}}"#));
        assert!(!result_has_cow_mapping("not json"));
    }

    // ── write probe ────────────────────────────────────────────

    #[test]
    fn probe_detects_new_and_changed_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1").unwrap();
        let before = capture_write_probe(dir.path());

        std::fs::write(dir.path().join("a.csv"), "12").unwrap();
        std::fs::write(dir.path().join("b.csv"), "new").unwrap();
        let after = capture_write_probe(dir.path());

        let changed = diff_write_probe(&before, &after);
        assert_eq!(changed, vec!["a.csv".to_string(), "b.csv".to_string()]);
    }

    #[test]
    fn probe_of_unchanged_tree_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1").unwrap();
        let before = capture_write_probe(dir.path());
        let after = capture_write_probe(dir.path());
        assert!(diff_write_probe(&before, &after).is_empty());
    }
}
