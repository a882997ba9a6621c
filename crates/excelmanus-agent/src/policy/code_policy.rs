//! Static risk classification for proposed Python snippets.
//!
//! The scanner works on the source text: imports and call sites are
//! recognized syntactically (including `as` aliases), capabilities are
//! assigned from the module manifest, and the tier falls out of the
//! capability set. Full Python parsing lives in the sandbox wrapper
//! subprocess; here an unbalanced-delimiter source is simply RED.
//!
//! Tier ladder:
//! - GREEN: SAFE_COMPUTE / SAFE_IO only
//! - YELLOW: adds NETWORK
//! - RED: SUBPROCESS, DYNAMIC_EXEC, SYSTEM_CONTROL, OBFUSCATION, or a
//!   source that does not scan

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::manifest::{
    module_root, normalize_module_root, DANGEROUS_ATTR_CALLS, DANGEROUS_CALLS, NETWORK_MODULES,
    SAFE_COMPUTE_MODULES, SAFE_IO_MODULES, SUBPROCESS_MODULES, SYSTEM_CONTROL_MODULES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskTier {
    Green,
    Yellow,
    Red,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Green => "GREEN",
            RiskTier::Yellow => "YELLOW",
            RiskTier::Red => "RED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    SafeCompute,
    SafeIo,
    Network,
    Subprocess,
    DynamicExec,
    SystemControl,
    Obfuscation,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::SafeCompute => "SAFE_COMPUTE",
            Capability::SafeIo => "SAFE_IO",
            Capability::Network => "NETWORK",
            Capability::Subprocess => "SUBPROCESS",
            Capability::DynamicExec => "DYNAMIC_EXEC",
            Capability::SystemControl => "SYSTEM_CONTROL",
            Capability::Obfuscation => "OBFUSCATION",
        }
    }
}

const RED_CAPABILITIES: &[Capability] = &[
    Capability::Subprocess,
    Capability::DynamicExec,
    Capability::SystemControl,
    Capability::Obfuscation,
];

/// Risk classification of one proposed snippet. Ephemeral, per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub tier: RiskTier,
    pub capabilities: BTreeSet<Capability>,
    pub details: Vec<String>,
    pub analysis_error: Option<String>,
}

impl CodeAnalysis {
    pub fn capability_summary(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*import\s+(.+?)\s*$").expect("static regex"));
static FROM_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*from\s+([\w.]+)\s+import\s+(.+?)\s*$").expect("static regex"));
static ATTR_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_]\w*)\s*\.\s*([A-Za-z_]\w*)\s*\(").expect("static regex"));
static NAME_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w.])([A-Za-z_]\w*)\s*\(").expect("static regex"));

/// Local name → fully qualified module/attr path, built from import
/// statements (handles `as` aliases and `from x import y`).
fn collect_imports(code: &str) -> HashMap<String, String> {
    let mut imported = HashMap::new();

    for caps in IMPORT_RE.captures_iter(code) {
        for part in caps[1].split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut words = part.split_whitespace();
            let Some(module) = words.next() else { continue };
            let alias = match (words.next(), words.next()) {
                (Some("as"), Some(alias)) => alias,
                _ => module,
            };
            imported.insert(alias.to_string(), module.to_string());
        }
    }

    for caps in FROM_IMPORT_RE.captures_iter(code) {
        let module = caps[1].to_string();
        for part in caps[2].split(',') {
            let part = part.trim().trim_end_matches(')').trim_start_matches('(');
            if part.is_empty() || part == "*" {
                continue;
            }
            let mut words = part.split_whitespace();
            let Some(name) = words.next() else { continue };
            let alias = match (words.next(), words.next()) {
                (Some("as"), Some(alias)) => alias,
                _ => name,
            };
            imported.insert(alias.to_string(), format!("{}.{}", module, name));
        }
    }

    imported
}

/// Delimiter balance check with string-literal awareness; a source that
/// fails this cannot be executed and is classified RED upstream.
fn scan_balanced(code: &str) -> Result<(), String> {
    let mut stack: Vec<char> = Vec::new();
    let mut chars = code.chars().peekable();
    let mut in_string: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(quote) = in_string {
            if c == '\\' {
                chars.next();
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '#' => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
            }
            '\'' | '"' => in_string = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return Err(format!("unbalanced '{}'", c));
                }
            }
            _ => {}
        }
    }
    if let Some(open) = stack.last() {
        return Err(format!("unclosed '{}'", open));
    }
    Ok(())
}

pub struct CodePolicyEngine {
    extra_safe: Vec<String>,
    extra_blocked: Vec<String>,
}

impl Default for CodePolicyEngine {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}

impl CodePolicyEngine {
    pub fn new(extra_safe_modules: &[String], extra_blocked_modules: &[String]) -> Self {
        Self {
            extra_safe: extra_safe_modules.to_vec(),
            extra_blocked: extra_blocked_modules.to_vec(),
        }
    }

    pub fn analyze(&self, code: &str) -> CodeAnalysis {
        if code.trim().is_empty() {
            let mut capabilities = BTreeSet::new();
            capabilities.insert(Capability::SafeCompute);
            return CodeAnalysis {
                tier: RiskTier::Green,
                capabilities,
                details: vec!["empty or whitespace-only code".to_string()],
                analysis_error: None,
            };
        }

        if let Err(reason) = scan_balanced(code) {
            return CodeAnalysis {
                tier: RiskTier::Red,
                capabilities: BTreeSet::new(),
                details: vec![format!("syntax error: {}", reason)],
                analysis_error: Some(reason),
            };
        }

        let imported = collect_imports(code);
        let mut capabilities = BTreeSet::new();
        let mut details = Vec::new();
        let mut has_base64 = false;
        let mut has_exec_call = false;

        // classify every imported module
        for module in imported.values() {
            // `from x import y` records `x.y`; classify the module part
            let module_for_class = module.as_str();
            self.classify_module(module_for_class, &mut capabilities, &mut details);
            if module_root(module_for_class) == "base64" {
                has_base64 = true;
            }
        }

        // dangerous bare calls: exec / eval / compile / __import__,
        // plus names bound by `from sys import exit`-style imports
        for caps in NAME_CALL_RE.captures_iter(code) {
            let name = &caps[1];
            if DANGEROUS_CALLS.contains(&name) {
                capabilities.insert(Capability::DynamicExec);
                details.push(format!("dangerous call: {}()", name));
                if name == "exec" {
                    has_exec_call = true;
                }
            }
            if let Some(resolved) = imported.get(name) {
                if let Some((root, attr)) = resolved.rsplit_once('.') {
                    if DANGEROUS_ATTR_CALLS.contains(&(module_root(root), attr)) {
                        capabilities.insert(Capability::Subprocess);
                        details.push(format!("dangerous imported call: {}.{}()", root, attr));
                    }
                }
            }
        }

        // dangerous `obj.attr(...)` calls, resolving `import os as x`
        for caps in ATTR_CALL_RE.captures_iter(code) {
            let obj = &caps[1];
            let attr = &caps[2];
            let real_module = imported
                .get(obj)
                .map(|s| s.as_str())
                .unwrap_or(obj);
            let root = module_root(real_module);
            if DANGEROUS_ATTR_CALLS.contains(&(root, attr)) {
                capabilities.insert(Capability::Subprocess);
                details.push(format!("dangerous attr call: {}.{}()", root, attr));
            }
        }

        if has_base64 && has_exec_call {
            capabilities.insert(Capability::Obfuscation);
            details.push("obfuscation: base64 + exec combination".to_string());
        }

        let tier = if RED_CAPABILITIES.iter().any(|c| capabilities.contains(c)) {
            RiskTier::Red
        } else if capabilities.contains(&Capability::Network) {
            RiskTier::Yellow
        } else {
            RiskTier::Green
        };

        CodeAnalysis {
            tier,
            capabilities,
            details,
            analysis_error: None,
        }
    }

    fn classify_module(
        &self,
        module_name: &str,
        capabilities: &mut BTreeSet<Capability>,
        details: &mut Vec<String>,
    ) {
        let root = module_root(module_name);
        let normalized = normalize_module_root(root);

        let blocked = |s: &str| self.extra_blocked.iter().any(|b| b == s);
        if blocked(root) || blocked(normalized) || blocked(module_name) {
            capabilities.insert(Capability::Subprocess);
            details.push(format!("blocked by policy override: {}", module_name));
            return;
        }

        let safe = |s: &str| self.extra_safe.iter().any(|b| b == s);
        if safe(root) || safe(normalized) || safe(module_name) {
            capabilities.insert(Capability::SafeCompute);
            return;
        }

        let in_set = |set: &[&str]| set.contains(&module_name) || set.contains(&normalized);
        if in_set(SAFE_COMPUTE_MODULES) {
            capabilities.insert(Capability::SafeCompute);
        } else if in_set(SAFE_IO_MODULES) {
            capabilities.insert(Capability::SafeIo);
        } else if in_set(NETWORK_MODULES) {
            capabilities.insert(Capability::Network);
            details.push(format!("network module: {}", module_name));
        } else if in_set(SUBPROCESS_MODULES) {
            capabilities.insert(Capability::Subprocess);
            details.push(format!("subprocess module: {}", module_name));
        } else if in_set(SYSTEM_CONTROL_MODULES) {
            capabilities.insert(Capability::SystemControl);
            details.push(format!("system control module: {}", module_name));
        } else {
            // unknown third-party modules default to filesystem-level
            // trust; the sandbox still guards the actual I/O
            capabilities.insert(Capability::SafeIo);
        }
    }
}

// ── exit-call sanitizer ─────────────────────────────────────────

static EXIT_ATTR_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)([A-Za-z_]\w*)\s*\.\s*(exit|_exit)\s*\(.*\)\s*(#.*)?$")
        .expect("static regex")
});
static EXIT_BUILTIN_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)(exit|quit)\s*\(.*\)\s*(#.*)?$").expect("static regex"));

const EXIT_ATTR_PATTERNS: &[(&str, &str)] = &[("sys", "exit"), ("os", "_exit")];

/// Remove `sys.exit()` / `os._exit()` / `exit()` / `quit()` statements,
/// replacing each with `pass` at the same indentation.
///
/// Returns `None` when the code contains no exit calls or cannot be
/// scanned; the caller then keeps the original classification.
pub fn strip_exit_calls(code: &str) -> Option<String> {
    if code.trim().is_empty() || scan_balanced(code).is_err() {
        return None;
    }

    let imported = collect_imports(code);
    let resolve_root = |obj: &str| -> String {
        let resolved = imported.get(obj).map(|s| s.as_str()).unwrap_or(obj);
        module_root(resolved).to_string()
    };

    let mut removed = 0;
    let mut out_lines = Vec::new();
    for line in code.lines() {
        if let Some(caps) = EXIT_ATTR_LINE_RE.captures(line) {
            let root = resolve_root(&caps[2]);
            let attr = &caps[3];
            if EXIT_ATTR_PATTERNS.contains(&(root.as_str(), attr)) {
                out_lines.push(format!("{}pass", &caps[1]));
                removed += 1;
                continue;
            }
        }
        if let Some(caps) = EXIT_BUILTIN_LINE_RE.captures(line) {
            out_lines.push(format!("{}pass", &caps[1]));
            removed += 1;
            continue;
        }
        out_lines.push(line.to_string());
    }

    if removed == 0 {
        return None;
    }
    Some(out_lines.join("\n"))
}

// ── Excel target extraction ─────────────────────────────────────

/// A spreadsheet operation target spotted in a `run_code` snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcelTarget {
    pub file_path: String,
    pub sheet_name: Option<String>,
    /// "read" | "write" | "unknown"
    pub operation: String,
    pub source: String,
}

static PANDAS_READ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.\s*(read_excel|read_csv)\s*\(\s*['"]([^'"]+)['"]"#).expect("static regex")
});
static PANDAS_WRITE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.\s*(to_excel|to_csv)\s*\(\s*['"]([^'"]+)['"]"#).expect("static regex")
});
static LOAD_WORKBOOK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"load_workbook\s*\(\s*['"]([^'"]+)['"]"#).expect("static regex")
});
static SAVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\w+\s*\.\s*save\s*\(\s*['"]([^'"]+)['"]"#).expect("static regex")
});
static SHEET_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"sheet_name\s*=\s*['"]([^'"]+)['"]"#).expect("static regex")
});

const EXCEL_LITERAL_EXTENSIONS: &[&str] = &[".xlsx", ".xls", ".xlsm", ".csv"];

fn is_excel_literal(value: &str) -> bool {
    let lower = value.to_lowercase();
    EXCEL_LITERAL_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Literal-path spreadsheet operation targets found in Python code.
/// Variable arguments cannot be resolved statically and are skipped
/// (writes through `wb.save(var)` are caught by the write probe).
pub fn extract_excel_targets(code: &str) -> Vec<ExcelTarget> {
    if code.trim().is_empty() {
        return Vec::new();
    }
    let mut targets = Vec::new();

    for line in code.lines() {
        let sheet_name = SHEET_NAME_RE
            .captures(line)
            .map(|caps| caps[1].to_string());

        if let Some(caps) = PANDAS_READ_RE.captures(line) {
            targets.push(ExcelTarget {
                file_path: caps[2].to_string(),
                sheet_name: sheet_name.clone(),
                operation: "read".to_string(),
                source: format!("pd.{}", &caps[1]),
            });
        }
        if let Some(caps) = PANDAS_WRITE_RE.captures(line) {
            targets.push(ExcelTarget {
                file_path: caps[2].to_string(),
                sheet_name: sheet_name.clone(),
                operation: "write".to_string(),
                source: format!("df.{}", &caps[1]),
            });
        }
        if let Some(caps) = LOAD_WORKBOOK_RE.captures(line) {
            targets.push(ExcelTarget {
                file_path: caps[1].to_string(),
                sheet_name: None,
                operation: "unknown".to_string(),
                source: "openpyxl.load_workbook".to_string(),
            });
        }
        if let Some(caps) = SAVE_RE.captures(line) {
            if is_excel_literal(&caps[1]) {
                targets.push(ExcelTarget {
                    file_path: caps[1].to_string(),
                    sheet_name: None,
                    operation: "write".to_string(),
                    source: "wb.save".to_string(),
                });
            }
        }
    }
    targets
}
