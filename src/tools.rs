//! Tool descriptor catalog for the supported headless/interactive CLIs.
//!
//! Each supported CLI is a variant carrying its command name, capability flags, and
//! two argument builders: one for a fresh spawn, one for an initial prompt delivered
//! after the child is ready. Unknown-but-executable tools resolve to `ToolKind::Generic`,
//! which has no capabilities and passes the prompt as a single trailing argument.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub interactive: bool,
    pub supports_system_prompt: bool,
    pub supports_initial_prompt: bool,
    pub supports_permission_modes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolKind {
    Claude,
    Codex,
    Aider,
    Generic { command: String },
}

impl ToolKind {
    pub fn id(&self) -> &str {
        match self {
            ToolKind::Claude => "claude",
            ToolKind::Codex => "codex",
            ToolKind::Aider => "aider",
            ToolKind::Generic { command } => command.as_str(),
        }
    }

    pub fn command(&self) -> &str {
        self.id()
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            ToolKind::Claude => Capabilities {
                interactive: true,
                supports_system_prompt: true,
                supports_initial_prompt: true,
                supports_permission_modes: true,
            },
            ToolKind::Codex => Capabilities {
                interactive: true,
                supports_system_prompt: false,
                supports_initial_prompt: true,
                supports_permission_modes: true,
            },
            ToolKind::Aider => Capabilities {
                interactive: true,
                supports_system_prompt: false,
                supports_initial_prompt: false,
                supports_permission_modes: false,
            },
            ToolKind::Generic { .. } => Capabilities {
                interactive: false,
                supports_system_prompt: false,
                supports_initial_prompt: false,
                supports_permission_modes: false,
            },
        }
    }

    /// Required environment variable this tool needs to run headless, if any.
    pub fn required_env(&self) -> Option<&'static str> {
        None
    }

    /// Build the argument vector for spawning a fresh agent.
    ///
    /// `model` and `permission_mode` are applied where the tool supports them;
    /// `prompt` is the task prompt (system + task, pre-composed by the supervisor).
    pub fn build_args(&self, model: &str, permission_mode: &str, prompt: &str) -> Vec<String> {
        match self {
            ToolKind::Claude => {
                let mut args = vec!["--model".to_string(), model.to_string()];
                if permission_mode == "skip" {
                    args.push("--dangerously-skip-permissions".to_string());
                } else if !permission_mode.is_empty() && permission_mode != "default" {
                    args.push("--permission-mode".to_string());
                    args.push(permission_mode.to_string());
                }
                args.push(prompt.to_string());
                args
            }
            ToolKind::Codex => {
                vec![
                    "--model".to_string(),
                    model.to_string(),
                    "--full-auto".to_string(),
                    prompt.to_string(),
                ]
            }
            ToolKind::Aider => vec!["--message".to_string(), prompt.to_string()],
            ToolKind::Generic { .. } => vec![prompt.to_string()],
        }
    }

    /// Build the argument vector for a headless run (no attached PTY consumer),
    /// mirroring the supported-CLI quirks that require extra flags to avoid hanging.
    pub fn build_headless_args(&self, model: &str, permission_mode: &str, prompt: &str) -> Vec<String> {
        let mut args = self.build_args(model, permission_mode, prompt);
        match self {
            ToolKind::Claude => args.insert(0, "--print".to_string()),
            ToolKind::Codex => args.insert(0, "exec".to_string()),
            _ => {}
        }
        args
    }

    /// Build an initial-prompt-only argument vector, used when the tool was spawned
    /// without a task prompt and the prompt is delivered once the child signals ready.
    pub fn build_initial_prompt_args(&self, prompt: &str) -> Option<Vec<String>> {
        if !self.capabilities().supports_initial_prompt {
            return None;
        }
        Some(vec![prompt.to_string()])
    }

    pub fn parse(name: &str) -> ToolKind {
        match name {
            "claude" => ToolKind::Claude,
            "codex" => ToolKind::Codex,
            "aider" => ToolKind::Aider,
            other => ToolKind::Generic { command: other.to_string() },
        }
    }
}

/// Process-wide catalog: immutable once built from config + CLI overrides.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolKind>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolKind>) -> Self {
        Self { tools }
    }

    pub fn resolve(&self, id: &str) -> ToolKind {
        self.tools
            .iter()
            .find(|t| t.id() == id)
            .cloned()
            .unwrap_or_else(|| ToolKind::parse(id))
    }

    pub fn known_ids(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.id()).collect()
    }
}
