//! Per-conversation counters and logs.

use serde::{Deserialize, Serialize};

/// Pre-computed effect class of a tool call, derived from the tool
/// definition before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteHint {
    ReadOnly,
    MayWrite,
    #[default]
    Unknown,
}

/// One entry of the session's write log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOperation {
    pub tool_name: String,
    pub file_path: String,
    pub summary: String,
}

/// A plan proposal captured while plan mode intercepts `task_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub title: String,
    pub detail: String,
    pub done: bool,
}

/// Per-conversation mutable state. Lives for one conversation and is
/// reset wholesale on a new session; `has_write_tool_call` is monotonic
/// within a session.
#[derive(Debug, Default)]
pub struct SessionState {
    has_write_tool_call: bool,
    pub current_write_hint: WriteHint,
    pub write_operations_log: Vec<WriteOperation>,
    pub verification_attempt_count: usize,
    pub finish_task_warned: bool,
    /// Tags describing the current task, set by the router/transport;
    /// drive the verifier strength.
    pub task_tags: Vec<String>,
    /// Plan-mode intercept flag plus captured proposals.
    pub plan_intercept_task_create: bool,
    pub plan_tasks: Vec<PlanTask>,
    /// Current loop iteration (turn number for checkpoints).
    pub turn: usize,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_write_tool_call(&self) -> bool {
        self.has_write_tool_call
    }

    /// Record that a write-class tool call succeeded. Monotonic: only a
    /// full reset clears it.
    pub fn record_write_action(&mut self) {
        self.has_write_tool_call = true;
    }

    pub fn log_write_operation(
        &mut self,
        tool_name: impl Into<String>,
        file_path: impl Into<String>,
        summary: impl Into<String>,
    ) {
        self.record_write_action();
        self.write_operations_log.push(WriteOperation {
            tool_name: tool_name.into(),
            file_path: file_path.into(),
            summary: summary.into(),
        });
    }

    /// Full session reset; the only place the write flag goes back to
    /// false.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_flag_is_monotonic() {
        let mut state = SessionState::new();
        assert!(!state.has_write_tool_call());
        state.record_write_action();
        assert!(state.has_write_tool_call());
        // stays true across further operations
        state.current_write_hint = WriteHint::ReadOnly;
        assert!(state.has_write_tool_call());
    }

    #[test]
    fn reset_clears_everything() {
        let mut state = SessionState::new();
        state.log_write_operation("write_cells", "report.csv", "A1=42");
        state.verification_attempt_count = 2;
        state.finish_task_warned = true;
        state.reset();
        assert!(!state.has_write_tool_call());
        assert!(state.write_operations_log.is_empty());
        assert_eq!(state.verification_attempt_count, 0);
        assert!(!state.finish_task_warned);
    }

    #[test]
    fn log_write_operation_sets_flag_and_appends() {
        let mut state = SessionState::new();
        state.log_write_operation("run_code", "outputs/out.csv", "created");
        assert!(state.has_write_tool_call());
        assert_eq!(state.write_operations_log.len(), 1);
        assert_eq!(state.write_operations_log[0].tool_name, "run_code");
    }
}
