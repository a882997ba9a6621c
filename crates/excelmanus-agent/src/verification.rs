//! Finish-task verifier policy.
//!
//! The verifier is a subagent reviewing the completion report before
//! `finish_task` is accepted. Its strength comes from the task tags:
//! data-risky tags block on a confident failure, everything else is
//! advisory, and pure read tasks skip verification entirely. Blocking
//! is bounded to [`MAX_BLOCKING_ATTEMPTS`] so a stubborn verifier
//! cannot trap the loop.

use serde::{Deserialize, Serialize};

use crate::session::WriteHint;

/// Marker prefix on verifier output that blocks the finish.
pub const BLOCK_PREFIX: &str = "BLOCK:";

/// After this many blocking rounds the level downgrades to advisory.
pub const MAX_BLOCKING_ATTEMPTS: usize = 2;

/// Tags whose tasks get a blocking verifier.
pub const BLOCKING_TAGS: &[&str] = &["cross_sheet", "large_data", "formula", "multi_file"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierLevel {
    Skip,
    Advisory,
    Blocking,
}

/// Strength selection: read-only tasks with no writes skip; blocking
/// tags win over everything else; the default is advisory.
pub fn resolve_verifier_level(
    task_tags: &[String],
    has_write: bool,
    write_hint: WriteHint,
) -> VerifierLevel {
    if !has_write && write_hint == WriteHint::ReadOnly {
        return VerifierLevel::Skip;
    }
    if task_tags
        .iter()
        .any(|tag| BLOCKING_TAGS.contains(&tag.as_str()))
    {
        return VerifierLevel::Blocking;
    }
    VerifierLevel::Advisory
}

/// Parsed verifier subagent verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierVerdict {
    pub verdict: String,
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub checks: Vec<String>,
}

impl VerifierVerdict {
    pub fn is_confident_fail(&self) -> bool {
        self.verdict == "fail" && self.confidence == "high"
    }
}

/// Extract the verdict JSON from a verifier reply. The subagent is
/// instructed to answer with a bare JSON object, but replies wrapped in
/// prose or code fences are tolerated.
pub fn parse_verdict(summary: &str) -> Option<VerifierVerdict> {
    if let Ok(verdict) = serde_json::from_str::<VerifierVerdict>(summary.trim()) {
        return Some(verdict);
    }
    // fall back to the first {...} block in the reply
    let start = summary.find('{')?;
    let end = summary.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&summary[start..=end]).ok()
}

/// Render the verdict into the text appended to (or replacing) the
/// finish_task result. Blocking + confident fail gets the block marker.
pub fn render_verdict(verdict: &VerifierVerdict, blocking: bool) -> String {
    if verdict.verdict == "pass" {
        let checks = if verdict.checks.is_empty() {
            String::new()
        } else {
            format!(" ({})", verdict.checks.join(", "))
        };
        return format!("\n\n✅ Verification passed{}", checks);
    }

    let issues = if verdict.issues.is_empty() {
        "unspecified issues".to_string()
    } else {
        verdict.issues.join("; ")
    };

    if blocking && verdict.is_confident_fail() {
        return format!(
            "{}⚠️ Verification failed: {}. Fix the issues and call finish_task again.",
            BLOCK_PREFIX, issues
        );
    }

    format!(
        "\n\n⚠️ Verification found issues (advisory): {} (task still marked complete; review \
         recommended)",
        issues
    )
}
