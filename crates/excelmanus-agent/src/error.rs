//! Structured error types for the agent core.
//!
//! Recoverable conditions (bad arguments, policy rejections, tool
//! runtime failures) never travel as `AgentError`; they are rendered
//! into tool-result strings the LLM can read and react to. Only
//! infrastructure and data-corruption conditions reach these variants
//! and abort the session with a `task_error` event.

use thiserror::Error;

use crate::workspace::WorkspaceError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    // --- Session lifecycle ---
    #[error("session cancelled")]
    Cancelled,

    #[error("iteration cap reached after {iterations} iterations")]
    IterationCap { iterations: usize },

    // --- Provider / LLM ---
    #[error("provider error: {0}")]
    Provider(String),

    // --- Workspace / storage ---
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("registry storage error: {0}")]
    Storage(String),

    #[error("version store corrupt: {0}")]
    CorruptVersionStore(String),

    // --- Interaction ---
    #[error("interaction timed out: {interaction_id}")]
    InteractionTimeout { interaction_id: String },

    #[error("approval not found: {approval_id}")]
    ApprovalNotFound { approval_id: String },

    // --- Serialization ---
    #[error("serialization error: {0}")]
    Serialization(String),

    // --- Generic internal ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<excelmanus::error::LlmError> for AgentError {
    fn from(e: excelmanus::error::LlmError) -> Self {
        AgentError::Provider(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(AgentError::Cancelled.to_string(), "session cancelled");
        assert_eq!(
            AgentError::IterationCap { iterations: 30 }.to_string(),
            "iteration cap reached after 30 iterations"
        );
        assert_eq!(
            AgentError::ApprovalNotFound {
                approval_id: "ap-1".into()
            }
            .to_string(),
            "approval not found: ap-1"
        );
    }

    #[test]
    fn from_llm_error_wraps_as_provider() {
        let llm = excelmanus::error::LlmError::ProviderError("503".into());
        let err: AgentError = llm.into();
        assert!(matches!(err, AgentError::Provider(_)));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn from_serde_json_error_wraps_as_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: AgentError = json_err.into();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
