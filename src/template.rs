use crate::config::HomerConfig;

/// Generate CLAUDE.md content from homer config.
pub fn generate_claude_md(config: &HomerConfig) -> String {
    let mut lines = Vec::new();

    lines.push(format!("# {}", config.project.name));
    if !config.project.stack.is_empty() {
        lines.push(format!("Stack: {}", config.project.stack));
    }
    lines.push(String::new());

    lines.push("## Build & Test".into());
    lines.push(String::new());
    lines.push("- Build: `cargo build`".into());
    lines.push("- Test: `cargo test`".into());
    lines.push("- Lint: `cargo clippy`".into());
    lines.push("- Format: `cargo fmt`".into());
    lines.push(String::new());

    lines.push("## Homer Agent".into());
    lines.push(String::new());
    lines.push("You are one agent in a supervised, multi-agent development loop.".into());
    lines.push(String::new());

    lines.push("### State (read first every session)".into());
    lines.push("- `prd.json` — your task list; find your assigned story/subtask here.".into());
    lines.push("- `.homer/context.md` — auto-generated snapshot of all agents and their status.".into());
    lines.push(String::new());

    lines.push("### Protocol".into());
    lines.push("1. Work the story or subtask named in your prompt.".into());
    lines.push("2. When done, print `HOMER_DONE` — the supervisor runs verification for you.".into());
    lines.push(
        "3. If verification fails, a feedback block is written back with the failing checks; fix and print `HOMER_DONE` again.".into(),
    );
    lines.push("4. Stuck -> print `HOMER_BLOCKED: <reason>` and stop.".into());
    lines.push(String::new());

    lines.push("### Hard rules".into());
    lines.push(format!("- Max {} verification attempts before the supervisor reroutes the task to a fresh agent.", crate::scheduler::MAX_VERIFY));
    lines.push("- Never weaken or skip the verify commands to make them pass.".into());
    lines.push("- One task per agent process; do not pick up other agents' work.".into());

    lines.join("\n") + "\n"
}
