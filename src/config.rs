use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// `homer.toml` at the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HomerConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub stack: String,
    #[serde(default)]
    pub repo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSettings {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            permission_mode: default_permission_mode(),
            label_prefix: default_label_prefix(),
        }
    }
}

/// A tool catalog entry: backend command plus default model, seeding `tools::ToolCatalog`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_max_agents() -> usize {
    4
}
fn default_permission_mode() -> String {
    "default".into()
}
fn default_label_prefix() -> String {
    "agent".into()
}
fn default_model() -> String {
    "sonnet".into()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read homer.toml: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse homer.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize homer.toml: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl HomerConfig {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join("homer.toml");
        let content = std::fs::read_to_string(&path)?;
        let config: HomerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let path = project_dir.join("homer.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Generate a minimal homer.toml for a new project.
    pub fn scaffold(name: &str, stack: &str) -> Self {
        let mut tools = BTreeMap::new();
        tools.insert("claude".to_string(), ToolEntry { model: "sonnet".into() });
        Self {
            project: ProjectConfig { name: name.into(), stack: stack.into(), repo: None },
            orchestrator: OrchestratorSettings::default(),
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
[project]
name = "my-app"
stack = "Rust, axum"
repo = "acme/widgets"

[orchestrator]
max_agents = 6
permission_mode = "skip"

[tools.claude]
model = "sonnet"

[tools.codex]
model = "o3"
"#;

    #[test]
    fn parse_full_config() {
        let config: HomerConfig = toml::from_str(SAMPLE_TOML).unwrap();
        assert_eq!(config.project.name, "my-app");
        assert_eq!(config.project.repo.as_deref(), Some("acme/widgets"));
        assert_eq!(config.orchestrator.max_agents, 6);
        assert_eq!(config.orchestrator.permission_mode, "skip");
        assert_eq!(config.tools.len(), 2);
        assert_eq!(config.tools["codex"].model, "o3");
    }

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[project]
name = "bare"
"#;
        let config: HomerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.max_agents, 4);
        assert_eq!(config.orchestrator.permission_mode, "default");
        assert!(config.tools.is_empty());
    }

    #[test]
    fn scaffold_creates_default() {
        let config = HomerConfig::scaffold("test-app", "Rust");
        assert_eq!(config.project.name, "test-app");
        assert_eq!(config.orchestrator.max_agents, 4);
        assert!(config.tools.contains_key("claude"));
    }

    #[test]
    fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = HomerConfig::scaffold("roundtrip", "Rust, axum");
        config.save(dir.path()).unwrap();
        let loaded = HomerConfig::load(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = HomerConfig::load(dir.path());
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
