//! Skill packs: named bundles of tool scopes and prompt fragments.
//!
//! One pack is active per session; `activate_skill` switches. The pack
//! registry's own storage is external; the engine only consumes
//! registered packs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPack {
    pub name: String,
    pub description: String,
    /// System-prompt fragment injected while the pack is active.
    pub instructions: String,
    /// Tool scope labels (or tool names) this pack exposes; empty
    /// means every tool.
    pub tool_scope: Vec<String>,
}

#[derive(Default)]
pub struct SkillPackSet {
    packs: HashMap<String, SkillPack>,
    active: Option<String>,
}

impl SkillPackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pack: SkillPack) {
        self.packs.insert(pack.name.clone(), pack);
    }

    /// Switch the active pack. Unknown names leave the current pack in
    /// place and report the available ones.
    pub fn activate(&mut self, name: &str) -> Result<&SkillPack, String> {
        if !self.packs.contains_key(name) {
            let mut available: Vec<&str> = self.packs.keys().map(String::as_str).collect();
            available.sort();
            return Err(format!(
                "unknown skill pack: {} (available: {})",
                name,
                available.join(", ")
            ));
        }
        self.active = Some(name.to_string());
        Ok(&self.packs[name])
    }

    pub fn active(&self) -> Option<&SkillPack> {
        self.active.as_deref().and_then(|name| self.packs.get(name))
    }

    pub fn active_instructions(&self) -> String {
        self.active()
            .map(|p| p.instructions.clone())
            .unwrap_or_default()
    }

    /// Scope filter of the active pack; `None` when no pack is active
    /// or the pack exposes everything.
    pub fn active_scope(&self) -> Option<Vec<String>> {
        let pack = self.active()?;
        if pack.tool_scope.is_empty() {
            return None;
        }
        Some(pack.tool_scope.clone())
    }

    pub fn list(&self) -> Vec<&SkillPack> {
        let mut packs: Vec<&SkillPack> = self.packs.values().collect();
        packs.sort_by(|a, b| a.name.cmp(&b.name));
        packs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(name: &str, scope: &[&str]) -> SkillPack {
        SkillPack {
            name: name.to_string(),
            description: format!("{} pack", name),
            instructions: format!("use {} conventions", name),
            tool_scope: scope.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn activate_switches_active_pack() {
        let mut set = SkillPackSet::new();
        set.register(pack("excel", &["core"]));
        set.register(pack("reporting", &[]));

        assert!(set.active().is_none());
        set.activate("excel").unwrap();
        assert_eq!(set.active().unwrap().name, "excel");
        set.activate("reporting").unwrap();
        assert_eq!(set.active().unwrap().name, "reporting");
    }

    #[test]
    fn activate_unknown_lists_available() {
        let mut set = SkillPackSet::new();
        set.register(pack("excel", &[]));
        let err = set.activate("nope").unwrap_err();
        assert!(err.contains("excel"));
        assert!(set.active().is_none());
    }

    #[test]
    fn empty_scope_means_no_filter() {
        let mut set = SkillPackSet::new();
        set.register(pack("open", &[]));
        set.register(pack("narrow", &["read_cells"]));

        set.activate("open").unwrap();
        assert!(set.active_scope().is_none());
        set.activate("narrow").unwrap();
        assert_eq!(set.active_scope().unwrap(), vec!["read_cells".to_string()]);
    }
}
