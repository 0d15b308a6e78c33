//! Minimal git awareness: just enough to recover `owner/name` from the origin
//! remote for `paths::repo_slug`. The orchestrator treats version control as an
//! external collaborator — no commit/push/worktree management lives here.

use std::path::Path;
use std::process::Command;

/// Check if directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// `owner/name` parsed from the `origin` remote URL, if one is configured.
/// Handles both `git@host:owner/name.git` and `https://host/owner/name.git` forms.
pub fn origin_owner_repo(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    parse_owner_repo(&url)
}

fn parse_owner_repo(url: &str) -> Option<String> {
    let stripped = url.strip_suffix(".git").unwrap_or(url);
    let tail = if let Some(idx) = stripped.rfind(':') {
        &stripped[idx + 1..]
    } else if let Some(idx) = stripped.find("://") {
        let rest = &stripped[idx + 3..];
        let slash = rest.find('/')?;
        &rest[slash + 1..]
    } else {
        return None;
    };
    let parts: Vec<&str> = tail.rsplitn(3, '/').collect();
    match parts.len() {
        2 => Some(format!("{}/{}", parts[1], parts[0])),
        _ => None,
    }
}

/// The repository's top-level directory, or `dir` itself if not a git repo.
pub fn toplevel(dir: &Path) -> std::path::PathBuf {
    Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| std::path::PathBuf::from(String::from_utf8_lossy(&o.stdout).trim()))
        .unwrap_or_else(|| dir.to_path_buf())
}
