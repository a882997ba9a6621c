//! Sandboxed code execution contract.
//!
//! The Python wrapper that enforces tier restrictions (import blocks,
//! socket denial, guarded `open()`, CoW redirection) runs in a
//! subprocess and is a black box to the core. The contract between the
//! two sides is a set of environment variables plus a CoW log file:
//!
//! - `EXCELMANUS_STAGING_MAP`: JSON map absolute_original → absolute_staged
//! - `EXCELMANUS_BENCH_PROTECTED_DIRS`: comma-separated workspace-relative
//!   paths whose files are copied on first write
//! - `EXCELMANUS_COW_LOG`: file where the wrapper appends one
//!   `orig<TAB>copy` line per CoW event

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::code_policy::RiskTier;

pub const ENV_STAGING_MAP: &str = "EXCELMANUS_STAGING_MAP";
pub const ENV_PROTECTED_DIRS: &str = "EXCELMANUS_BENCH_PROTECTED_DIRS";
pub const ENV_COW_LOG: &str = "EXCELMANUS_COW_LOG";
pub const ENV_SANDBOX_TIER: &str = "EXCELMANUS_SANDBOX_TIER";

const OUTPUT_TAIL_CHARS: usize = 4000;

/// One sandboxed execution request.
#[derive(Debug, Clone)]
pub struct CodeRunRequest {
    pub code: String,
    pub tier: RiskTier,
    pub workspace_root: PathBuf,
    pub tmp_dir: PathBuf,
    pub staging_map_json: String,
    pub protected_dirs: Vec<String>,
    pub cow_log_path: PathBuf,
    pub timeout: Duration,
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRunOutput {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub timed_out: bool,
    /// Workspace-relative CoW mappings reported through the log file.
    pub cow_mapping: HashMap<String, String>,
}

impl CodeRunOutput {
    pub fn to_result_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"exit_code\": {}, \"stdout_tail\": \"\"}}", self.exit_code)
        })
    }
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, request: &CodeRunRequest) -> Result<CodeRunOutput, String>;
}

/// Parse a CoW log: one `orig<TAB>copy` line per event. Malformed lines
/// are skipped.
pub fn parse_cow_log(path: &Path) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    let Ok(data) = std::fs::read_to_string(path) else {
        return mapping;
    };
    for line in data.lines() {
        let Some((orig, copy)) = line.split_once('\t') else {
            continue;
        };
        let (orig, copy) = (orig.trim(), copy.trim());
        if orig.is_empty() || copy.is_empty() {
            continue;
        }
        mapping.insert(orig.to_string(), copy.to_string());
    }
    mapping
}

fn tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let start = text.len() - max_chars;
    // stay on a char boundary
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(start);
    format!("...{}", &text[start..])
}

/// Runs the snippet with the system Python interpreter under the env
/// contract. Deployments with the Docker sandbox swap in their own
/// [`SandboxRunner`] that prepends the container invocation.
pub struct ProcessSandboxRunner {
    python_bin: String,
}

impl Default for ProcessSandboxRunner {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
        }
    }
}

impl ProcessSandboxRunner {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
        }
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandboxRunner {
    async fn run(&self, request: &CodeRunRequest) -> Result<CodeRunOutput, String> {
        std::fs::create_dir_all(&request.tmp_dir)
            .map_err(|e| format!("failed to create tmp dir: {}", e))?;
        let code_file = request
            .tmp_dir
            .join(format!("run_{}.py", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        std::fs::write(&code_file, &request.code)
            .map_err(|e| format!("failed to write code file: {}", e))?;

        let mut cmd = tokio::process::Command::new(&self.python_bin);
        cmd.arg(&code_file)
            .current_dir(&request.workspace_root)
            .env(ENV_STAGING_MAP, &request.staging_map_json)
            .env(ENV_PROTECTED_DIRS, request.protected_dirs.join(","))
            .env(ENV_COW_LOG, &request.cow_log_path)
            .env(ENV_SANDBOX_TIER, request.tier.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.python_bin, e))?;

        let waited = tokio::time::timeout(request.timeout, child.wait_with_output()).await;
        let _ = std::fs::remove_file(&code_file);

        let (exit_code, stdout, stderr, timed_out) = match waited {
            Ok(Ok(output)) => (
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
                false,
            ),
            Ok(Err(err)) => return Err(format!("code execution failed: {}", err)),
            Err(_) => (-1, String::new(), "execution timed out".to_string(), true),
        };

        let cow_mapping = parse_cow_log(&request.cow_log_path);

        Ok(CodeRunOutput {
            exit_code,
            stdout_tail: tail(&stdout, OUTPUT_TAIL_CHARS),
            stderr_tail: tail(&stderr, OUTPUT_TAIL_CHARS),
            timed_out,
            cow_mapping,
        })
    }
}
