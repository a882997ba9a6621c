//! Subagent profiles and delegation results.
//!
//! A subagent is a specialized agent (verifier, planner, worker) run
//! as a short child session with a restricted tool scope. The engine
//! owns the spawning; this module holds the profile registry and the
//! result types the parent consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentProfile {
    pub name: String,
    pub description: String,
    /// System prompt fragment for the child session.
    pub system_prompt: String,
    /// Tool scope labels / names the child may use; empty = all.
    pub tool_scope: Vec<String>,
    /// "readOnly" children never get write tools.
    pub permission_mode: String,
    pub max_iterations: usize,
}

/// Outcome of one delegated run, surfaced to the parent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentResult {
    pub success: bool,
    pub summary: String,
    pub subagent_name: String,
    /// Workspace-relative paths the child modified.
    pub structured_changes: Vec<String>,
    /// Set when the child suspended on a high-risk approval; the
    /// parent bridges the decision to the user.
    pub pending_approval_id: Option<String>,
}

#[derive(Default)]
pub struct SubagentRegistry {
    profiles: HashMap<String, SubagentProfile>,
}

impl SubagentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock subagents.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SubagentProfile {
            name: "verifier".to_string(),
            description: "Reviews a completion report against the workspace and reports \
                          pass/fail with confidence."
                .to_string(),
            system_prompt: "You are a verification agent. Check the reported work against the \
                            actual files. Reply with a single JSON object: {\"verdict\": \
                            \"pass\"|\"fail\", \"confidence\": \"high\"|\"medium\"|\"low\", \
                            \"issues\": [..], \"checks\": [..]}. Do not modify any file."
                .to_string(),
            tool_scope: vec!["list_files".to_string(), "read_cells".to_string()],
            permission_mode: "readOnly".to_string(),
            max_iterations: 6,
        });
        registry.register(SubagentProfile {
            name: "planner".to_string(),
            description: "Breaks a request into ordered, checkable steps.".to_string(),
            system_prompt: "You are a planning agent. Produce a short ordered plan for the \
                            task. Do not execute anything."
                .to_string(),
            tool_scope: vec!["list_files".to_string(), "read_cells".to_string()],
            permission_mode: "readOnly".to_string(),
            max_iterations: 4,
        });
        registry.register(SubagentProfile {
            name: "excel_worker".to_string(),
            description: "Executes a scoped spreadsheet manipulation task.".to_string(),
            system_prompt: "You are a spreadsheet worker agent. Complete exactly the task you \
                            were given, then call finish_task."
                .to_string(),
            tool_scope: vec![],
            permission_mode: "default".to_string(),
            max_iterations: 12,
        });
        registry
    }

    pub fn register(&mut self, profile: SubagentProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&SubagentProfile> {
        self.profiles.get(name)
    }

    /// Profile for a delegation without an explicit agent name.
    pub fn default_worker(&self) -> Option<&SubagentProfile> {
        self.get("excel_worker").or_else(|| {
            let mut names: Vec<&String> = self.profiles.keys().collect();
            names.sort();
            names.first().and_then(|n| self.profiles.get(*n))
        })
    }

    pub fn list(&self) -> Vec<&SubagentProfile> {
        let mut profiles: Vec<&SubagentProfile> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    /// Human-readable listing for the `list_subagents` tool.
    pub fn describe(&self) -> String {
        let profiles = self.list();
        if profiles.is_empty() {
            return "No subagents are registered.".to_string();
        }
        let mut lines = vec!["Available subagents:".to_string()];
        for profile in profiles {
            lines.push(format!(
                "- {} ({}): {}",
                profile.name, profile.permission_mode, profile.description
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_verifier_and_worker() {
        let registry = SubagentRegistry::with_defaults();
        assert!(registry.get("verifier").is_some());
        assert!(registry.get("planner").is_some());
        assert_eq!(registry.default_worker().unwrap().name, "excel_worker");
    }

    #[test]
    fn verifier_is_read_only() {
        let registry = SubagentRegistry::with_defaults();
        let verifier = registry.get("verifier").unwrap();
        assert_eq!(verifier.permission_mode, "readOnly");
        assert!(!verifier.tool_scope.contains(&"write_cells".to_string()));
    }

    #[test]
    fn describe_lists_all_profiles() {
        let registry = SubagentRegistry::with_defaults();
        let text = registry.describe();
        assert!(text.contains("verifier"));
        assert!(text.contains("planner"));
        assert!(text.contains("excel_worker"));
    }
}
