//! Risk-tiered approval pipeline.
//!
//! Tools fall into three buckets: read-only safe (direct execution),
//! audit-only (execute, but capture pre/post snapshots and an audit
//! record), and high risk (suspend on explicit user consent unless the
//! session runs with full access).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// A high-risk tool call awaiting user consent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub approval_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub tool_call_id: String,
    pub created_at: String,
}

/// User decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Reject,
    /// Accept and flip the session into full-access mode so subsequent
    /// high-risk calls execute without further prompts.
    FullAccessRetry,
}

/// Changes captured around an audited tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub approval_id: String,
    pub tool_name: String,
    pub changes: Vec<String>,
    pub undoable: bool,
    pub created_at: String,
}

pub struct ApprovalManager {
    high_risk_tools: HashSet<String>,
    audit_only_tools: HashSet<String>,
    read_only_safe_tools: HashSet<String>,
    pending: Option<PendingApproval>,
}

impl Default for ApprovalManager {
    fn default() -> Self {
        let as_set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            high_risk_tools: as_set(&["delete_file", "delete_sheet", "run_shell", "batch_replace"]),
            audit_only_tools: as_set(&["write_cells", "run_code"]),
            read_only_safe_tools: as_set(&["list_files", "read_cells", "list_subagents"]),
            pending: None,
        }
    }
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_risk_tools(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.high_risk_tools = names.into_iter().collect();
        self
    }

    pub fn is_high_risk_tool(&self, name: &str) -> bool {
        self.high_risk_tools.contains(name)
    }

    pub fn is_audit_only_tool(&self, name: &str) -> bool {
        self.audit_only_tools.contains(name)
    }

    pub fn is_read_only_safe_tool(&self, name: &str) -> bool {
        self.read_only_safe_tools.contains(name)
    }

    pub fn new_approval_id() -> String {
        format!("ap-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
    }

    pub fn utc_now() -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }

    /// Register a pending approval; any previous pending one is
    /// superseded (the loop holds at most one at a time).
    pub fn create_pending(
        &mut self,
        tool_name: &str,
        arguments: Map<String, Value>,
        tool_call_id: &str,
    ) -> PendingApproval {
        let pending = PendingApproval {
            approval_id: Self::new_approval_id(),
            tool_name: tool_name.to_string(),
            arguments,
            tool_call_id: tool_call_id.to_string(),
            created_at: Self::utc_now(),
        };
        self.pending = Some(pending.clone());
        pending
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    /// Claim the pending approval by id; mismatched ids leave it in
    /// place.
    pub fn take_pending(&mut self, approval_id: &str) -> Option<PendingApproval> {
        if self.pending.as_ref()?.approval_id == approval_id {
            return self.pending.take();
        }
        None
    }

    pub fn clear_pending(&mut self) -> Option<PendingApproval> {
        self.pending.take()
    }

    /// Tool-result text shown to the LLM while the approval waits.
    pub fn format_pending_prompt(pending: &PendingApproval) -> String {
        format!(
            "⏸ The `{}` operation needs user approval (id: {}). Waiting for the user's \
             decision; do not retry the call in the meantime.",
            pending.tool_name, pending.approval_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("file".to_string(), json!("report.csv"));
        map
    }

    #[test]
    fn default_risk_sets_classify_builtins() {
        let manager = ApprovalManager::new();
        assert!(manager.is_high_risk_tool("delete_file"));
        assert!(manager.is_audit_only_tool("write_cells"));
        assert!(manager.is_read_only_safe_tool("read_cells"));
        assert!(!manager.is_high_risk_tool("read_cells"));
    }

    #[test]
    fn pending_lifecycle_take_by_id() {
        let mut manager = ApprovalManager::new();
        let pending = manager.create_pending("delete_file", args(), "tc1");
        assert!(manager.pending().is_some());

        // wrong id leaves it pending
        assert!(manager.take_pending("ap-nope").is_none());
        assert!(manager.pending().is_some());

        let taken = manager.take_pending(&pending.approval_id).unwrap();
        assert_eq!(taken.tool_name, "delete_file");
        assert!(manager.pending().is_none());
    }

    #[test]
    fn new_pending_supersedes_old() {
        let mut manager = ApprovalManager::new();
        let first = manager.create_pending("delete_file", args(), "tc1");
        let second = manager.create_pending("run_shell", args(), "tc2");
        assert!(manager.take_pending(&first.approval_id).is_none());
        assert_eq!(
            manager.take_pending(&second.approval_id).unwrap().tool_name,
            "run_shell"
        );
    }

    #[test]
    fn pending_prompt_mentions_tool_and_id() {
        let mut manager = ApprovalManager::new();
        let pending = manager.create_pending("delete_file", args(), "tc1");
        let prompt = ApprovalManager::format_pending_prompt(&pending);
        assert!(prompt.contains("delete_file"));
        assert!(prompt.contains(&pending.approval_id));
    }

    #[test]
    fn approval_decision_serde() {
        assert_eq!(
            serde_json::to_string(&ApprovalDecision::FullAccessRetry).unwrap(),
            r#""full_access_retry""#
        );
        let decision: ApprovalDecision = serde_json::from_str(r#""accept""#).unwrap();
        assert_eq!(decision, ApprovalDecision::Accept);
    }
}
