//! Session event stream.
//!
//! Events are append-only and ordered per session; the SSE transport
//! serializes them one JSON object per line. The `event_type` tag and
//! field names are part of the wire contract with the frontend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use excelmanus::Usage;

use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    pub timestamp: i64,
    pub session_id: String,
    pub iteration: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AgentEventKind {
    LlmCallStarted {
        message_count: usize,
    },
    LlmCallFinished {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        tool_calls: usize,
    },
    ToolCallStarted {
        tool_name: String,
        arguments: String,
    },
    ToolCallFinished {
        tool_name: String,
        is_error: bool,
        result: String,
    },
    /// Files were created or modified by a tool call.
    FilesChanged {
        paths: Vec<String>,
    },
    /// Sheet-level cell deltas for a changed workbook/CSV file.
    ExcelDiff {
        file_path: String,
        sheet: String,
        affected_range: String,
        changes: Vec<CellChange>,
    },
    /// A high-risk tool call is waiting for user consent.
    PendingApproval {
        approval_id: String,
        tool_name: String,
    },
    /// The LLM asked the user a question mid-loop.
    UserQuestion {
        question_id: String,
        header: String,
        text: String,
        options: Vec<QuestionOption>,
        multi_select: bool,
    },
    TurnCheckpointCreated {
        turn: usize,
        paths: Vec<String>,
    },
    RollbackApplied {
        turn: usize,
        restored: Vec<String>,
    },
    SkillActivated {
        skill_name: String,
    },
    SubagentStarted {
        subagent_name: String,
        task: String,
    },
    SubagentFinished {
        subagent_name: String,
        success: bool,
    },
    TaskDone {
        summary: String,
    },
    TaskError {
        message: String,
    },
    Cancelled,
}

/// One cell delta in an [`AgentEventKind::ExcelDiff`] event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellChange {
    pub cell: String,
    pub old: String,
    pub new: String,
}

/// One choice offered in a [`AgentEventKind::UserQuestion`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    pub label: String,
    pub description: String,
}

#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &AgentEvent) -> Result<(), AgentError>;
}
