//! Project export bundle: a self-contained snapshot of a homer project for
//! archival or hand-off — config, PRD, generated docs, and a manifest
//! summarizing the persistent memory store and recent git history.
//!
//! Clean-and-recreate the output directory, `copy_if_exists`/`copy_dir_recursive`
//! helpers, a `manifest.json` written last. Skills directories and assistant
//! transcript copying have no counterpart in this project's scope and are dropped.

use crate::config::HomerConfig;
use crate::git;
use crate::memory::{MemoryError, MemoryStats, MemoryStore};
use crate::paths;
use crate::task_source::Prd;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("task source error: {0}")]
    TaskSource(#[from] crate::task_source::TaskSourceError),
    #[error("project not initialized: no homer.toml in {0}")]
    NotInitialized(PathBuf),
}

#[derive(Debug, Serialize)]
pub struct ExportManifest {
    pub homer_version: String,
    pub exported_at: String,
    pub project_dir: PathBuf,
    pub project_name: String,
    pub stories: StorySummary,
    pub memory: MemoryStats,
    pub git: Option<GitInfo>,
    pub files: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct StorySummary {
    pub total: usize,
    pub passing: usize,
    pub pending: usize,
}

#[derive(Debug, Serialize)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub latest_commit: Option<String>,
    pub commits_included: usize,
    pub log: Vec<String>,
    pub diffstat: String,
}

/// Export `project_dir` (an initialized homer project) to `output_dir`: copies
/// `homer.toml`, `prd.json`, `CLAUDE.md`/`AGENTS.md`, the project's `.homer/context.md`
/// if present, and this repo's `memory.db` (via the slug derived from `homer.toml`),
/// then writes `manifest.json` last.
pub fn export_project(
    project_dir: &Path,
    output_dir: &Path,
    git_commits: usize,
) -> Result<ExportManifest, ExportError> {
    if !project_dir.join("homer.toml").exists() {
        return Err(ExportError::NotInitialized(project_dir.to_path_buf()));
    }

    if output_dir.exists() {
        std::fs::remove_dir_all(output_dir)?;
    }
    std::fs::create_dir_all(output_dir)?;

    let mut files = Vec::new();
    for name in ["homer.toml", "prd.json", "CLAUDE.md", "AGENTS.md"] {
        if copy_if_exists(&project_dir.join(name), &output_dir.join(name))? {
            files.push(name.to_string());
        }
    }
    let project_context = paths::project_context_md(project_dir);
    if copy_if_exists(&project_context, &output_dir.join("context.md"))? {
        files.push(".homer/context.md".to_string());
    }

    let config = HomerConfig::load(project_dir).map_err(|_| ExportError::NotInitialized(project_dir.to_path_buf()))?;
    let slug = paths::repo_slug(config.project.repo.as_deref(), project_dir);

    let memory_stats = {
        let db_path = paths::memory_db_path(&slug);
        if db_path.exists() {
            let store = MemoryStore::open(&db_path)?;
            let stats = store.stats();
            std::fs::copy(&db_path, output_dir.join("memory.db"))?;
            files.push("memory.db".to_string());
            stats
        } else {
            MemoryStats::default()
        }
    };

    let stories = Prd::load(project_dir)?
        .map(|prd| {
            let total = prd.user_stories.len();
            let passing = prd.user_stories.iter().filter(|s| s.passes).count();
            StorySummary { total, passing, pending: total - passing }
        })
        .unwrap_or_default();

    let git_info = capture_git_info(project_dir, git_commits);

    let manifest = ExportManifest {
        homer_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        project_dir: project_dir.to_path_buf(),
        project_name: config.project.name,
        stories,
        memory: memory_stats,
        git: git_info,
        files,
    };

    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(output_dir.join("manifest.json"), manifest_json)?;

    Ok(manifest)
}

fn copy_if_exists(src: &Path, dst: &Path) -> std::io::Result<bool> {
    if !src.exists() {
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(true)
}

/// Best-effort git history capture: absent or failing git commands just yield `None`,
/// since a project directory need not be a git repo.
fn capture_git_info(project_dir: &Path, commits: usize) -> Option<GitInfo> {
    if !git::is_git_repo(project_dir) {
        return None;
    }
    let commits = commits.max(1);

    let branch = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(project_dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());

    let latest_commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(project_dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());

    let log = Command::new("git")
        .args(["log", &format!("-{commits}"), "--format=%H %aI %an %s"])
        .current_dir(project_dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| {
            String::from_utf8_lossy(&o.stdout)
                .lines()
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let diffstat = Command::new("git")
        .args(["diff", "--stat", &format!("HEAD~{commits}..HEAD")])
        .current_dir(project_dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default();

    Some(GitInfo { branch, latest_commit, commits_included: log.len(), log, diffstat })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_source::Story;
    use std::process::Command;

    fn scaffold(dir: &Path) {
        std::env::set_var("HOME", dir);
        let config = HomerConfig::scaffold("exported-app", "Rust");
        config.save(dir).unwrap();
        let prd = Prd {
            project: "exported-app".into(),
            branch_name: None,
            description: Some("desc".into()),
            user_stories: vec![
                Story {
                    id: "S1".into(),
                    title: "one".into(),
                    description: "".into(),
                    acceptance_criteria: vec![],
                    priority: None,
                    passes: true,
                    notes: None,
                },
                Story {
                    id: "S2".into(),
                    title: "two".into(),
                    description: "".into(),
                    acceptance_criteria: vec![],
                    priority: None,
                    passes: false,
                    notes: None,
                },
            ],
        };
        prd.save(dir).unwrap();
        std::fs::write(dir.join("CLAUDE.md"), "# exported-app\n").unwrap();
    }

    #[test]
    fn export_fails_without_homer_toml() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let result = export_project(dir.path(), out.path(), 10);
        assert!(matches!(result, Err(ExportError::NotInitialized(_))));
    }

    #[test]
    fn export_copies_core_files_and_summarizes_stories() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        let out = dir.path().join("bundle");

        let manifest = export_project(dir.path(), &out, 5).unwrap();

        assert!(out.join("homer.toml").exists());
        assert!(out.join("prd.json").exists());
        assert!(out.join("CLAUDE.md").exists());
        assert!(out.join("manifest.json").exists());
        assert_eq!(manifest.project_name, "exported-app");
        assert_eq!(manifest.stories.total, 2);
        assert_eq!(manifest.stories.passing, 1);
        assert_eq!(manifest.stories.pending, 1);
    }

    #[test]
    fn export_overwrites_existing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        let out = dir.path().join("bundle");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("stale.txt"), "leftover").unwrap();

        export_project(dir.path(), &out, 5).unwrap();

        assert!(!out.join("stale.txt").exists());
        assert!(out.join("manifest.json").exists());
    }

    #[test]
    fn export_without_git_repo_has_no_git_info() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        let out = dir.path().join("bundle");

        let manifest = export_project(dir.path(), &out, 5).unwrap();
        assert!(manifest.git.is_none());
    }

    #[test]
    fn export_captures_git_info_when_repo_present() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path());
        Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.email", "t@t.com"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["config", "user.name", "T"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["add", "-A"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["commit", "-m", "init"]).current_dir(dir.path()).output().unwrap();

        let out = dir.path().join("bundle");
        let manifest = export_project(dir.path(), &out, 5).unwrap();

        let git_info = manifest.git.expect("git info expected");
        assert!(git_info.latest_commit.is_some());
        assert_eq!(git_info.log.len(), 1);
    }
}
