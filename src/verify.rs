//! Verification Runner: detect project verify commands, execute
//! with timeouts, normalize results, synthesize error keys.
//!
//! Grounded on `verify.rs`'s `run_verify`/`VerifyReport` (bash -c execution, stdout+
//! stderr concatenation), generalized from "one verify script per feature" to
//! "detect and run N project-wide checks".

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyCheck {
    pub name: String,
    pub command: String,
}

impl VerifyCheck {
    fn new(name: &str, command: &str) -> Self {
        Self { name: name.into(), command: command.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub truncated_output: String,
    pub error_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationResult {
    pub passed: bool,
    pub skipped: bool,
    pub results: Vec<CheckResult>,
}

/// Deterministic, fast-path detection of the project's own verify commands.
pub fn detect_checks(project_dir: &Path) -> Vec<VerifyCheck> {
    let mut checks = Vec::new();

    if let Some(pkg) = read_package_json(project_dir) {
        detect_node_checks(project_dir, &pkg, &mut checks);
    }
    detect_python_checks(project_dir, &mut checks);

    if checks.is_empty() && has_makefile_check_target(project_dir) {
        checks.push(VerifyCheck::new("check", "make check"));
    }

    checks
}

fn read_package_json(project_dir: &Path) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(project_dir.join("package.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn detect_node_checks(project_dir: &Path, pkg: &serde_json::Value, checks: &mut Vec<VerifyCheck>) {
    let scripts = pkg.get("scripts").and_then(|s| s.as_object());
    let Some(scripts) = scripts else { return };

    if scripts.contains_key("typecheck") {
        checks.push(VerifyCheck::new("typecheck", "npm run typecheck"));
    } else if scripts.contains_key("type-check") {
        checks.push(VerifyCheck::new("typecheck", "npm run type-check"));
    } else if project_dir.join("tsconfig.json").is_file() {
        checks.push(VerifyCheck::new("typecheck", "npx tsc --noEmit"));
    }

    if scripts.contains_key("lint") {
        checks.push(VerifyCheck::new("lint", "npm run lint"));
    }

    if let Some(test_script) = scripts.get("test").and_then(|v| v.as_str())
        && !is_stock_test_stub(test_script)
    {
        checks.push(VerifyCheck::new("test", "npm test"));
    }

    if checks.is_empty() && scripts.contains_key("build") {
        checks.push(VerifyCheck::new("build", "npm run build"));
    }
}

fn is_stock_test_stub(script: &str) -> bool {
    script.to_lowercase().contains("no test specified")
}

fn detect_python_checks(project_dir: &Path, checks: &mut Vec<VerifyCheck>) {
    if has_mypy_config(project_dir) {
        checks.push(VerifyCheck::new("typecheck", "mypy ."));
    }
    if project_dir.join("tests").is_dir() || project_dir.join("test").is_dir() {
        checks.push(VerifyCheck::new("test", "pytest"));
    }
    if has_ruff_config(project_dir) {
        checks.push(VerifyCheck::new("lint", "ruff check ."));
    }
}

fn has_mypy_config(project_dir: &Path) -> bool {
    project_dir.join("mypy.ini").is_file() || pyproject_has_section(project_dir, "[tool.mypy]")
}

fn has_ruff_config(project_dir: &Path) -> bool {
    project_dir.join("ruff.toml").is_file()
        || project_dir.join(".ruff.toml").is_file()
        || pyproject_has_section(project_dir, "[tool.ruff]")
}

fn pyproject_has_section(project_dir: &Path, section: &str) -> bool {
    std::fs::read_to_string(project_dir.join("pyproject.toml"))
        .map(|content| content.contains(section))
        .unwrap_or(false)
}

fn has_makefile_check_target(project_dir: &Path) -> bool {
    std::fs::read_to_string(project_dir.join("Makefile"))
        .map(|content| content.lines().any(|l| l.trim_start().starts_with("check:")))
        .unwrap_or(false)
}

/// Run every detected check, each under a hard 120s timeout. Returns
/// `{passed:true, skipped:true, results:[]}` if no commands were detected.
pub async fn run_all(project_dir: &Path) -> VerificationResult {
    let checks = detect_checks(project_dir);
    if checks.is_empty() {
        return VerificationResult { passed: true, skipped: true, results: vec![] };
    }

    let mut results = Vec::with_capacity(checks.len());
    for check in &checks {
        results.push(run_check(project_dir, check).await);
    }
    let passed = results.iter().all(|r| r.passed);
    VerificationResult { passed, skipped: false, results }
}

async fn run_check(project_dir: &Path, check: &VerifyCheck) -> CheckResult {
    let mut command = tokio::process::Command::new("bash");
    command
        .arg("-c")
        .arg(&check.command)
        .current_dir(project_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let outcome = tokio::time::timeout(TIMEOUT, command.output()).await;

    match outcome {
        Ok(Ok(output)) => {
            let passed = output.status.success();
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let combined = format!("{stderr}{stdout}");
            let cap = if passed { 500 } else { 800 };
            let truncated_output = tail_chars(&combined, cap);
            let error_key = if passed { None } else { Some(extract_error_key(&check.name, &truncated_output)) };
            CheckResult { name: check.name.clone(), command: check.command.clone(), passed, truncated_output, error_key }
        }
        Ok(Err(e)) => CheckResult {
            name: check.name.clone(),
            command: check.command.clone(),
            passed: false,
            truncated_output: e.to_string(),
            error_key: Some(format!("{}:unknown", check.name)),
        },
        Err(_) => CheckResult {
            name: check.name.clone(),
            command: check.command.clone(),
            passed: false,
            truncated_output: format!("timed out after {}s", TIMEOUT.as_secs()),
            error_key: Some(format!("{}:unknown", check.name)),
        },
    }
}

fn tail_chars(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        s.to_string()
    } else {
        chars[chars.len() - max..].iter().collect()
    }
}

fn ts_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TS(\d{4,5})").unwrap())
}

fn test_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\w\-./]+\.(?:test|spec)\.[jt]sx?)").unwrap())
}

fn fail_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:✗|✕|FAIL|×|failing)\s*(.{1,60})").unwrap())
}

fn lint_rule_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:error|warning)\s+([\w-]+)").unwrap())
}

/// Error-key normalization: memory keys on this, so the precedence order
/// (TS code, then test-file, then lint rule, then fallback) is load-bearing.
pub fn extract_error_key(check_name: &str, output: &str) -> String {
    if let Some(cap) = ts_code_re().captures(output) {
        let code = &cap[1];
        return match crate::output::file_path_re().captures(output) {
            Some(f) => format!("typecheck:TS{code}:{}", &f[1]),
            None => format!("typecheck:TS{code}"),
        };
    }

    if let Some(cap) = test_file_re().captures(output) {
        let filename = &cap[1];
        let normalized = fail_name_re().captures(output).and_then(|name_cap| normalize_name(&name_cap[1]));
        return match normalized {
            Some(name) => format!("test:{filename}:{name}"),
            None => format!("test:{filename}"),
        };
    }

    if let Some(cap) = lint_rule_re().captures(output) {
        let rule = &cap[1];
        return match crate::output::file_path_re().captures(output) {
            Some(f) => format!("lint:{rule}:{}", &f[1]),
            None => format!("lint:{rule}"),
        };
    }

    match crate::output::file_path_re().captures(output) {
        Some(f) => format!("{check_name}:{}", &f[1]),
        None => format!("{check_name}:unknown"),
    }
}

/// 10-40 chars from the failing-test capture, spaces to underscores. Below the
/// 10-char floor the name isn't a useful normalization and the spec's
/// `[:<normalized_name>]` segment must be omitted entirely.
fn normalize_name(captured: &str) -> Option<String> {
    let trimmed = captured.trim();
    let capped: String = trimmed.chars().take(40).collect();
    if capped.chars().count() < 10 {
        return None;
    }
    Some(capped.replace(' ', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_explicit_typecheck_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"typecheck":"tsc --noEmit","lint":"eslint .","test":"jest"}}"#,
        )
        .unwrap();
        let checks = detect_checks(dir.path());
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"typecheck"));
        assert!(names.contains(&"lint"));
        assert!(names.contains(&"test"));
    }

    #[test]
    fn synthesizes_tsc_from_tsconfig_when_no_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"scripts":{}}"#).unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        let checks = detect_checks(dir.path());
        assert_eq!(checks[0].command, "npx tsc --noEmit");
    }

    #[test]
    fn skips_stock_test_stub() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"test":"echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        let checks = detect_checks(dir.path());
        assert!(checks.is_empty());
    }

    #[test]
    fn falls_back_to_build_when_nothing_else() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"scripts":{"build":"tsc"}}"#).unwrap();
        let checks = detect_checks(dir.path());
        assert_eq!(checks[0].name, "build");
    }

    #[test]
    fn detects_python_checks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mypy.ini"), "[mypy]\n").unwrap();
        std::fs::create_dir(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join("ruff.toml"), "").unwrap();
        let checks = detect_checks(dir.path());
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"typecheck"));
        assert!(names.contains(&"test"));
        assert!(names.contains(&"lint"));
    }

    #[test]
    fn makefile_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "check:\n\techo ok\n").unwrap();
        let checks = detect_checks(dir.path());
        assert_eq!(checks[0].command, "make check");
    }

    #[tokio::test]
    async fn skipped_when_no_commands_detected() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_all(dir.path()).await;
        assert!(result.passed);
        assert!(result.skipped);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn passing_check_via_makefile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "check:\n\techo ok\n").unwrap();
        let result = run_all(dir.path()).await;
        assert!(result.passed);
        assert_eq!(result.results.len(), 1);
        assert!(result.results[0].passed);
    }

    #[tokio::test]
    async fn failing_check_captures_error_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "check:\n\techo 'something went wrong' && exit 1\n").unwrap();
        let result = run_all(dir.path()).await;
        assert!(!result.passed);
        assert_eq!(result.results[0].error_key.as_deref(), Some("check:unknown"));
    }

    #[test]
    fn error_key_ts_code_with_file() {
        let key = extract_error_key("typecheck", "TS2322: type mismatch in src/lib/auth.ts");
        assert_eq!(key, "typecheck:TS2322:src/lib/auth.ts");
    }

    #[test]
    fn error_key_ts_code_without_file() {
        let key = extract_error_key("typecheck", "TS2322: type mismatch somewhere");
        assert_eq!(key, "typecheck:TS2322");
    }

    #[test]
    fn error_key_test_file() {
        let key = extract_error_key("test", "FAIL src/auth.test.ts\n  ✗ logs in correctly");
        assert!(key.starts_with("test:src/auth.test.ts"));
    }

    #[test]
    fn error_key_test_file_short_name_omits_normalized_segment() {
        let key = extract_error_key("test", "FAIL src/auth.test.ts\n  ✗ fails");
        assert_eq!(key, "test:src/auth.test.ts");
    }

    #[test]
    fn error_key_lint_rule() {
        let key = extract_error_key("lint", "error no-unused-vars in src/utils/helpers.js");
        assert_eq!(key, "lint:no-unused-vars:src/utils/helpers.js");
    }

    #[test]
    fn error_key_fallback_unknown() {
        let key = extract_error_key("build", "something broke but no file mentioned");
        assert_eq!(key, "build:unknown");
    }

    #[test]
    fn error_key_fallback_with_file() {
        let key = extract_error_key("build", "compile error in src/api/routes.rs");
        assert_eq!(key, "build:src/api/routes.rs");
    }
}
