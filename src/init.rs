use crate::config::HomerConfig;
use crate::paths;
use crate::task_source::Prd;
use crate::template;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("task source error: {0}")]
    TaskSource(#[from] crate::task_source::TaskSourceError),
    #[error("project already initialized: homer.toml exists")]
    AlreadyInitialized,
}

/// Initialize a homer project in the given directory: `homer.toml`, an empty
/// `prd.json`, CLAUDE.md/AGENTS.md, and the `~/.homer/` context directories
/// for this repo's slug.
pub fn init_project(project_dir: &Path, description: &str) -> Result<(), InitError> {
    let config_path = project_dir.join("homer.toml");
    if config_path.exists() {
        return Err(InitError::AlreadyInitialized);
    }

    let name = slugify_name(description);

    let config = HomerConfig::scaffold(&name, "");
    config.save(project_dir)?;

    let prd = Prd { project: name.clone(), branch_name: None, description: Some(description.to_string()), user_stories: vec![] };
    prd.save(project_dir)?;

    let claude_md = template::generate_claude_md(&config);
    std::fs::write(project_dir.join("CLAUDE.md"), &claude_md)?;
    std::fs::write(project_dir.join("AGENTS.md"), &claude_md)?;

    append_gitignore(project_dir, ".homer/context.md")?;

    let slug = paths::repo_slug(config.project.repo.as_deref(), project_dir);
    paths::ensure_context_dirs(&slug)?;

    Ok(())
}

/// Re-ensure an existing homer project's directories and regenerate CLAUDE.md/
/// AGENTS.md from the current `homer.toml` — the install-equivalent for a repo
/// that already has one.
pub fn install_project(project_dir: &Path) -> Result<(), InitError> {
    let config = HomerConfig::load(project_dir)?;

    let claude_md = template::generate_claude_md(&config);
    std::fs::write(project_dir.join("CLAUDE.md"), &claude_md)?;
    std::fs::write(project_dir.join("AGENTS.md"), &claude_md)?;

    append_gitignore(project_dir, ".homer/context.md")?;

    let slug = paths::repo_slug(config.project.repo.as_deref(), project_dir);
    paths::ensure_context_dirs(&slug)?;

    Ok(())
}

/// Append an entry to .gitignore if not already present.
fn append_gitignore(project_dir: &Path, entry: &str) -> Result<(), std::io::Error> {
    let gitignore = project_dir.join(".gitignore");
    let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&gitignore)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "{entry}")?;
    Ok(())
}

fn slugify_name(description: &str) -> String {
    description
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        init_project(dir.path(), "My Test App").unwrap();

        assert!(dir.path().join("homer.toml").exists());
        let config = HomerConfig::load(dir.path()).unwrap();
        assert_eq!(config.project.name, "my-test-app");

        assert!(dir.path().join("CLAUDE.md").exists());
        assert!(dir.path().join("AGENTS.md").exists());
        let claude = std::fs::read_to_string(dir.path().join("CLAUDE.md")).unwrap();
        let agents = std::fs::read_to_string(dir.path().join("AGENTS.md")).unwrap();
        assert_eq!(claude, agents);
        assert!(claude.contains("# my-test-app"));

        assert!(dir.path().join("prd.json").exists());
        let prd = Prd::load(dir.path()).unwrap().unwrap();
        assert!(prd.user_stories.is_empty());
    }

    #[test]
    fn init_fails_if_already_initialized() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        init_project(dir.path(), "test").unwrap();
        let result = init_project(dir.path(), "test again");
        assert!(matches!(result, Err(InitError::AlreadyInitialized)));
    }

    #[test]
    fn slugify_name_works() {
        assert_eq!(slugify_name("My Test App"), "my-test-app");
        assert_eq!(slugify_name("REST API with CRUD"), "rest-api-with");
        assert_eq!(slugify_name("simple"), "simple");
        assert_eq!(slugify_name("Hello World! 123"), "hello-world-123");
    }

    #[test]
    fn install_regenerates_claude_md() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        init_project(dir.path(), "test").unwrap();

        let mut config = HomerConfig::load(dir.path()).unwrap();
        config.project.name = "renamed-project".into();
        config.save(dir.path()).unwrap();

        install_project(dir.path()).unwrap();
        let claude = std::fs::read_to_string(dir.path().join("CLAUDE.md")).unwrap();
        assert!(claude.contains("# renamed-project"));
        let agents = std::fs::read_to_string(dir.path().join("AGENTS.md")).unwrap();
        assert!(agents.contains("# renamed-project"));
    }

    #[test]
    fn init_adds_context_md_to_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        init_project(dir.path(), "test").unwrap();

        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".homer/context.md"));
    }

    #[test]
    fn gitignore_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        init_project(dir.path(), "test").unwrap();
        install_project(dir.path()).unwrap();

        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        let count = gitignore.matches(".homer/context.md").count();
        assert_eq!(count, 1, ".homer/context.md should appear exactly once in .gitignore");
    }

    #[test]
    fn install_fails_without_homer_toml() {
        let dir = tempfile::tempdir().unwrap();
        let result = install_project(dir.path());
        assert!(result.is_err());
    }
}
