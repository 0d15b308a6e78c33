//! Filesystem layout helpers: `~/.homer/...` and `<cwd>/.homer/...`, and repo-slug
//! derivation (`"owner/name" -> "owner-name"`).

use std::path::{Path, PathBuf};

/// Derive the repo slug used to namespace `~/.homer/context/{slug}/...` and
/// `~/.homer/sessions/{slug}.json`.
///
/// `"owner/name"` lowercases to `"owner-name"`; an empty/unknown repo identifier
/// falls back to `"local-<last-two-cwd-segments>"`. Non-alphanumerics (besides `-`)
/// are stripped from the result.
pub fn repo_slug(repo: Option<&str>, cwd: &Path) -> String {
    let raw = match repo {
        Some(r) if !r.trim().is_empty() => r.replace('/', "-").to_lowercase(),
        _ => {
            let segments: Vec<String> = cwd
                .components()
                .filter_map(|c| c.as_os_str().to_str().map(|s| s.to_string()))
                .collect();
            let tail: Vec<&str> = segments
                .iter()
                .rev()
                .take(2)
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("local-{}", tail.join("-")).to_lowercase()
        }
    };
    strip_non_alphanumeric(&raw)
}

fn strip_non_alphanumeric(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// `~/.homer`.
pub fn homer_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".homer")
}

/// `~/.homer/sessions/{slug}.json`.
pub fn session_path(slug: &str) -> PathBuf {
    homer_home().join("sessions").join(format!("{slug}.json"))
}

/// `~/.homer/context/{slug}`.
pub fn context_dir(slug: &str) -> PathBuf {
    homer_home().join("context").join(slug)
}

/// `~/.homer/context/{slug}/memory.db`.
pub fn memory_db_path(slug: &str) -> PathBuf {
    context_dir(slug).join("memory.db")
}

/// `~/.homer/context/{slug}/agent-notes/{agent_id}.md`.
pub fn agent_notes_path(slug: &str, agent_id: &str) -> PathBuf {
    context_dir(slug).join("agent-notes").join(format!("{agent_id}.md"))
}

/// `~/.homer/context/{slug}/shared.md`.
pub fn shared_notes_path(slug: &str) -> PathBuf {
    context_dir(slug).join("shared.md")
}

/// `~/.homer/context/{slug}/workflows.log`.
pub fn workflows_log_path(slug: &str) -> PathBuf {
    context_dir(slug).join("workflows.log")
}

/// `~/.homer/context/{slug}/progress.txt`.
pub fn progress_path(slug: &str) -> PathBuf {
    context_dir(slug).join("progress.txt")
}

/// `<cwd>/.homer/context.md`.
pub fn project_context_md(project_dir: &Path) -> PathBuf {
    project_dir.join(".homer").join("context.md")
}

/// `<cwd>/.homer/stop-request` — touched by `homer stop`, polled by a running
/// `homer run` loop, removed once observed.
pub fn stop_request_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".homer").join("stop-request")
}

/// Ensure every directory `~/.homer/context/{slug}/...` needs exists.
pub fn ensure_context_dirs(slug: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(context_dir(slug).join("agent-notes"))?;
    std::fs::create_dir_all(homer_home().join("sessions"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_owner_name() {
        assert_eq!(repo_slug(Some("ACME/Widgets"), Path::new("/x")), "acme-widgets");
    }

    #[test]
    fn slug_strips_non_alphanumerics() {
        assert_eq!(repo_slug(Some("ACME/Wid.gets!"), Path::new("/x")), "acme-widgets");
    }

    #[test]
    fn slug_falls_back_to_cwd_tail() {
        let slug = repo_slug(None, Path::new("/home/user/projects/my-app"));
        assert_eq!(slug, "local-projects-my-app");
    }

    #[test]
    fn slug_empty_repo_falls_back() {
        let slug = repo_slug(Some(""), Path::new("/a/b"));
        assert!(slug.starts_with("local-"));
    }

    #[test]
    fn paths_are_namespaced_under_slug() {
        assert!(memory_db_path("acme-widgets").ends_with("acme-widgets/memory.db"));
        assert!(agent_notes_path("acme-widgets", "agent-1").ends_with("agent-notes/agent-1.md"));
    }

    #[test]
    fn stop_request_path_is_project_local() {
        let path = stop_request_path(Path::new("/proj"));
        assert_eq!(path, Path::new("/proj/.homer/stop-request"));
    }
}
