//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Guard behavior for `finish_task` when no write was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardMode {
    /// Never warn on write-less finishes.
    Off,
    /// First write-less finish is rejected with a warning; the next is
    /// accepted.
    #[default]
    Warn,
}

/// Per-session engine configuration.
///
/// Construct with [`EngineConfig::new`] and adjust with the builder
/// methods; all knobs default to the production values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workspace root for this session's [`crate::workspace::IsolatedWorkspace`].
    pub workspace_root: PathBuf,
    /// Maximum LLM/tool iterations per user turn.
    pub max_iterations: usize,
    /// Token budget for conversation memory trimming.
    pub memory_token_budget: usize,
    /// Guard behavior for write-less `finish_task` calls.
    pub guard_mode: GuardMode,
    /// Whether staged writes are routed through the transaction layer.
    /// When false, tools write to canonical paths directly.
    pub transaction_enabled: bool,
    /// Staging scope: `all` or `excel_only`.
    pub transaction_scope: String,
    /// Code policy engine toggle for `run_code`.
    pub code_policy_enabled: bool,
    pub code_policy_green_auto_approve: bool,
    pub code_policy_yellow_auto_approve: bool,
    pub code_policy_extra_safe_modules: Vec<String>,
    pub code_policy_extra_blocked_modules: Vec<String>,
    /// Full-access mode: high-risk tools and RED code execute without
    /// approval. Set per-session by explicit user opt-in only.
    pub full_access_enabled: bool,
    /// Subagent delegation toggle.
    pub subagent_enabled: bool,
    /// Blocking wait limit for user interactions.
    pub interaction_timeout: Duration,
    /// Wall-clock limit for sandboxed code execution.
    pub code_timeout: Duration,
    /// Workspace-relative directories protected by copy-on-write
    /// redirection inside the sandbox.
    pub protected_dirs: Vec<String>,
}

impl EngineConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_iterations: 30,
            memory_token_budget: 96_000,
            guard_mode: GuardMode::default(),
            transaction_enabled: true,
            transaction_scope: "all".to_string(),
            code_policy_enabled: true,
            code_policy_green_auto_approve: true,
            code_policy_yellow_auto_approve: false,
            code_policy_extra_safe_modules: Vec::new(),
            code_policy_extra_blocked_modules: Vec::new(),
            full_access_enabled: false,
            subagent_enabled: true,
            interaction_timeout: Duration::from_secs(600),
            code_timeout: Duration::from_secs(120),
            protected_dirs: Vec::new(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_guard_mode(mut self, guard_mode: GuardMode) -> Self {
        self.guard_mode = guard_mode;
        self
    }

    pub fn with_full_access(mut self, enabled: bool) -> Self {
        self.full_access_enabled = enabled;
        self
    }

    pub fn with_transaction_scope(mut self, scope: impl Into<String>) -> Self {
        self.transaction_scope = scope.into();
        self
    }

    pub fn with_interaction_timeout(mut self, timeout: Duration) -> Self {
        self.interaction_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = EngineConfig::new("/tmp/ws");
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.guard_mode, GuardMode::Warn);
        assert!(config.transaction_enabled);
        assert!(config.code_policy_enabled);
        assert!(config.code_policy_green_auto_approve);
        assert!(!config.code_policy_yellow_auto_approve);
        assert!(!config.full_access_enabled);
        assert_eq!(config.interaction_timeout, Duration::from_secs(600));
    }

    #[test]
    fn builder_methods_override() {
        let config = EngineConfig::new("/tmp/ws")
            .with_max_iterations(5)
            .with_guard_mode(GuardMode::Off)
            .with_full_access(true);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.guard_mode, GuardMode::Off);
        assert!(config.full_access_enabled);
    }
}
