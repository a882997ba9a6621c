//! Module capability manifest for the code policy engine.
//!
//! The sets mirror what the sandbox wrapper enforces at runtime; the
//! analyzer uses them for static classification so the two layers agree
//! on what a module can do.

/// Data/compute libraries considered safe at every tier.
pub const SAFE_COMPUTE_MODULES: &[&str] = &[
    "pandas", "numpy", "openpyxl", "xlsxwriter", "xlrd",
    "matplotlib", "seaborn", "plotly", "scipy", "sklearn",
    "re", "math", "cmath", "datetime", "time", "calendar",
    "collections", "itertools", "functools", "operator",
    "json", "csv", "typing", "dataclasses", "decimal",
    "statistics", "textwrap", "string", "copy", "pprint",
    "enum", "abc", "numbers", "fractions", "struct",
    "hashlib", "hmac", "secrets", "uuid",
    "warnings", "logging", "traceback",
    "unicodedata", "locale", "codecs",
    "bisect", "heapq", "array",
    "contextlib", "weakref",
    "pillow", "pyyaml", "beautifulsoup4",
];

/// Filesystem modules: safe inside the guarded-open sandbox.
pub const SAFE_IO_MODULES: &[&str] = &[
    "pathlib", "os.path", "os", "shutil", "tempfile",
    "glob", "fnmatch", "io", "zipfile", "gzip", "bz2", "lzma",
    "tarfile", "fileinput", "mmap",
];

/// Network-capable modules; importing any of these lifts the tier to
/// YELLOW.
pub const NETWORK_MODULES: &[&str] = &[
    "requests", "httpx", "aiohttp", "urllib", "socket", "ssl",
    "http", "ftplib", "smtplib", "imaplib", "poplib",
    "xmlrpc", "websocket", "websockets", "telnetlib",
];

/// Process-spawning modules; RED.
pub const SUBPROCESS_MODULES: &[&str] = &["subprocess", "pty", "pexpect"];

/// Host-control modules; RED.
pub const SYSTEM_CONTROL_MODULES: &[&str] = &[
    "ctypes", "signal", "resource", "multiprocessing",
    "webbrowser", "antigravity",
];

/// Dangerous bare calls; DYNAMIC_EXEC.
pub const DANGEROUS_CALLS: &[&str] = &["exec", "eval", "compile", "__import__"];

/// Dangerous `module.attr(...)` call sites; SUBPROCESS.
pub const DANGEROUS_ATTR_CALLS: &[(&str, &str)] = &[
    ("os", "system"),
    ("os", "popen"),
    ("os", "execl"), ("os", "execle"), ("os", "execlp"), ("os", "execlpe"),
    ("os", "execv"), ("os", "execve"), ("os", "execvp"), ("os", "execvpe"),
    ("os", "spawnl"), ("os", "spawnle"), ("os", "spawnlp"), ("os", "spawnlpe"),
    ("os", "spawnv"), ("os", "spawnve"), ("os", "spawnvp"), ("os", "spawnvpe"),
    ("os", "kill"), ("os", "_exit"),
    ("sys", "exit"),
    ("importlib", "import_module"),
];

/// Import-root aliases: the local import name differs from the package
/// the capability sets use.
pub const MODULE_ROOT_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("yaml", "pyyaml"),
    ("bs4", "beautifulsoup4"),
];

pub fn module_root(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

pub fn normalize_module_root(root: &str) -> &str {
    MODULE_ROOT_ALIASES
        .iter()
        .find(|(from, _)| *from == root)
        .map(|(_, to)| *to)
        .unwrap_or(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_root_splits_on_first_dot() {
        assert_eq!(module_root("urllib.request"), "urllib");
        assert_eq!(module_root("pandas"), "pandas");
    }

    #[test]
    fn aliases_normalize_to_package_names() {
        assert_eq!(normalize_module_root("PIL"), "pillow");
        assert_eq!(normalize_module_root("numpy"), "numpy");
    }
}
