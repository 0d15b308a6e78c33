mod config;
mod events;
mod export;
mod git;
mod init;
mod memory;
mod output;
mod paths;
mod pty;
mod scheduler;
mod server;
mod supervisor;
mod task_source;
mod template;
mod tools;
mod verify;

use clap::{Parser, Subcommand};
use config::HomerConfig;
use memory::MemoryStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use supervisor::Supervisor;
use task_source::Prd;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "homer", about = "Supervise a fleet of interactive coding-agent CLIs")]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Increase log verbosity (-v, -vv). Overrides RUST_LOG when set.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a homer project: homer.toml, prd.json, CLAUDE.md/AGENTS.md
    Init {
        /// Short project description, also used to derive the project name
        description: String,
    },
    /// Regenerate CLAUDE.md/AGENTS.md and ensure ~/.homer/ directories for an existing project
    Install,
    /// Run the supervised multi-agent development loop
    Run {
        /// Override the default tool for new agents (e.g. claude, codex, aider)
        #[arg(long)]
        tool: Option<String>,
        /// Override the model for the selected tool
        #[arg(long)]
        model: Option<String>,
        /// Override the repo identifier used for the memory/session slug (owner/name)
        #[arg(long)]
        repo: Option<String>,
        /// Max concurrent agents for this run
        #[arg(long, default_value_t = 1)]
        agents: usize,
        /// Prefix for generated agent ids (default from homer.toml)
        #[arg(long = "label-prefix")]
        label_prefix: Option<String>,
        /// Permission mode passed through to the underlying tool CLI
        #[arg(long = "permission-mode")]
        permission_mode: Option<String>,
        /// Resume agents from the last saved session for this repo
        #[arg(long)]
        resume: bool,
        /// Ignore any saved session and start clean (takes precedence over --resume)
        #[arg(long)]
        fresh: bool,
        /// Keep auto-spawning replacements as agents finish, up to max_agents
        #[arg(long)]
        auto: bool,
        /// Render a terminal dashboard (out of scope here; logs a warning and runs headless)
        #[arg(long)]
        watch: bool,
        /// Port for the HTTP + WebSocket control surface
        #[arg(long, default_value_t = 4190)]
        port: u16,
    },
    /// Run the project's own verify checks once, outside any agent session
    Verify,
    /// Show PRD story/subtask counts and the last-known in-flight agents
    Status,
    /// Ask a running `homer run` in this project to stop after its current step
    Stop,
    /// Show a persisted agent's output tail from the last session snapshot
    Logs {
        /// Agent id (default: agent-1)
        #[arg(default_value = "agent-1")]
        agent: String,
        /// Number of lines to show from the end
        #[arg(short, long, default_value_t = 50)]
        tail: usize,
    },
    /// Bundle project config, PRD, and memory-store stats for archival or hand-off
    Export {
        /// Output directory (default: <project>/.homer/export)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Git commits to include in the bundled history (default: 100)
        #[arg(long = "git-commits", default_value_t = 100)]
        git_commits: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match &cli.command {
        Commands::Init { description } => cmd_init(&cli.project, description),
        Commands::Install => cmd_install(&cli.project),
        Commands::Run { .. } => cmd_run(&cli.project, &cli.command),
        Commands::Verify => cmd_verify(&cli.project),
        Commands::Status => cmd_status(&cli.project),
        Commands::Stop => cmd_stop(&cli.project),
        Commands::Logs { agent, tail } => cmd_logs(&cli.project, agent, *tail),
        Commands::Export { output, git_commits } => cmd_export(&cli.project, output.clone(), *git_commits),
    };

    if let Err(message) = outcome {
        eprintln!("Error: {message}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("homer={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn cmd_init(project_dir: &Path, description: &str) -> Result<(), String> {
    init::init_project(project_dir, description).map_err(|e| e.to_string())?;
    println!("Initialized homer project in {}", project_dir.display());
    println!();
    println!("Created:");
    println!("  homer.toml              project config");
    println!("  prd.json                task list (empty — fill in your user stories)");
    println!("  CLAUDE.md               agent instructions");
    println!("  AGENTS.md               agent instructions (non-Claude)");
    println!();
    println!("Next: edit prd.json, then run `homer run --agents N`.");
    Ok(())
}

fn cmd_install(project_dir: &Path) -> Result<(), String> {
    init::install_project(project_dir).map_err(|e| e.to_string())?;
    println!("Installed homer project in {}", project_dir.display());
    println!();
    println!("Updated:");
    println!("  CLAUDE.md               regenerated from homer.toml");
    println!("  AGENTS.md               regenerated from homer.toml");
    println!("  ~/.homer/context/...    directories ensured");

    let config = HomerConfig::load(project_dir).map_err(|e| e.to_string())?;
    let mut missing = Vec::new();
    for (id, _) in &config.tools {
        let kind = tools::ToolKind::parse(id);
        if std::process::Command::new(kind.command())
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_err()
        {
            missing.push(kind.command().to_string());
        }
    }
    println!();
    if missing.is_empty() {
        println!("Tools: all OK ({})", config.tools.keys().cloned().collect::<Vec<_>>().join(", "));
    } else {
        for name in &missing {
            eprintln!("Warning: tool '{name}' not found in PATH");
        }
    }
    Ok(())
}

fn cmd_run(project_dir: &Path, command: &Commands) -> Result<(), String> {
    let Commands::Run { tool, model, repo, agents, label_prefix, permission_mode, resume, fresh, auto, watch, port } = command else {
        unreachable!("cmd_run called with a non-Run command")
    };

    if *watch {
        warn!("--watch requested a terminal dashboard; rendering a multi-pane UI is an external-collaborator concern here, running headless instead");
    }

    let mut config = HomerConfig::load(project_dir).map_err(|e| format!("{e} (run `homer init` first)"))?;

    if let Some(repo) = repo {
        config.project.repo = Some(repo.clone());
    } else if config.project.repo.is_none() {
        config.project.repo = git::origin_owner_repo(project_dir);
    }
    if let Some(prefix) = label_prefix {
        config.orchestrator.label_prefix = prefix.clone();
    }
    if let Some(mode) = permission_mode {
        config.orchestrator.permission_mode = mode.clone();
    }
    config.orchestrator.max_agents = (*agents).max(1);
    if let Some(tool) = tool {
        let model = model.clone().unwrap_or_else(|| "sonnet".to_string());
        config.tools = std::iter::once((tool.clone(), config::ToolEntry { model })).collect();
    }

    let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    rt.block_on(run_loop(project_dir.to_path_buf(), config, *resume, *fresh, *auto, *port))
}

async fn run_loop(
    project_dir: PathBuf,
    config: HomerConfig,
    resume: bool,
    fresh: bool,
    auto: bool,
    port: u16,
) -> Result<(), String> {
    let supervisor = Supervisor::new(project_dir.clone(), config, auto).map_err(|e| e.to_string())?;

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(supervisor, addr).await {
                warn!("control surface unavailable on {addr}: {e}");
            }
        });
    }
    info!("control surface listening on http://{addr}");

    if resume && !fresh {
        match supervisor.resume_from_session().await {
            Ok(n) if n > 0 => println!("Resumed {n} agent(s) from the last session."),
            Ok(_) => {}
            Err(e) => warn!("session resume failed: {e}"),
        }
    }

    let stop_request = paths::stop_request_path(&project_dir);
    let mut sessions = 0u64;
    loop {
        supervisor.auto_spawn().await;
        supervisor.publish_state().await;

        if stop_request.exists() {
            let _ = std::fs::remove_file(&stop_request);
            println!("Stop requested, shutting down.");
            break;
        }
        if supervisor.active_agent_count() == 0 {
            println!("No work remaining.");
            break;
        }
        sessions += 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    supervisor.shutdown().map_err(|e| e.to_string())?;
    println!("Stopped after {sessions} poll cycle(s).");
    Ok(())
}

fn cmd_verify(project_dir: &Path) -> Result<(), String> {
    let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    let result = rt.block_on(verify::run_all(project_dir));

    if result.skipped {
        println!("No verify checks detected for this project.");
        return Ok(());
    }

    let mut pass = 0;
    let mut fail = 0;
    for check in &result.results {
        let status = if check.passed {
            pass += 1;
            "PASS"
        } else {
            fail += 1;
            "FAIL"
        };
        println!("[{status}] {}", check.name);
        if !check.passed {
            for line in check.truncated_output.lines().take(5) {
                println!("  {line}");
            }
        }
    }
    println!();
    println!("{pass} passed, {fail} failed, {} total", result.results.len());
    if fail > 0 {
        return Err("verification failed".to_string());
    }
    Ok(())
}

fn cmd_stop(project_dir: &Path) -> Result<(), String> {
    let path = paths::stop_request_path(project_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(&path, b"").map_err(|e| e.to_string())?;
    println!("Stop requested. The running `homer run` will stop after its current poll cycle.");
    Ok(())
}

fn cmd_status(project_dir: &Path) -> Result<(), String> {
    let config = HomerConfig::load(project_dir).map_err(|e| e.to_string())?;
    let slug = paths::repo_slug(config.project.repo.as_deref(), project_dir);

    match Prd::load(project_dir).map_err(|e| e.to_string())? {
        Some(prd) => {
            let total = prd.user_stories.len();
            let passing = prd.user_stories.iter().filter(|s| s.passes).count();
            println!("Stories: {total} total ({passing} passing, {} pending)", total - passing);
            for story in prd.user_stories.iter().filter(|s| !s.passes).take(5) {
                println!("  - {} {}", story.id, story.title);
            }
        }
        None => println!("Stories: no prd.json found"),
    }

    let db_path = paths::memory_db_path(&slug);
    if db_path.exists() {
        if let Ok(store) = MemoryStore::open(&db_path) {
            let stats = store.stats();
            println!();
            println!(
                "Memory: {} solutions, {} rules, {} task runs, {} file records",
                stats.solutions, stats.repo_rules, stats.task_runs, stats.file_knowledge
            );
        }
    }

    let session_path = paths::session_path(&slug);
    match std::fs::read_to_string(&session_path) {
        Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(snapshot) => {
                let agents = snapshot.get("agents").and_then(|a| a.as_array()).cloned().unwrap_or_default();
                println!();
                println!("Agents (last saved session, {}): {}", snapshot.get("savedAt").and_then(|v| v.as_str()).unwrap_or("?"), agents.len());
                for agent in &agents {
                    let id = agent.get("id").and_then(|v| v.as_str()).unwrap_or("?");
                    let status = agent.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                    let task = agent.get("task").and_then(|v| v.as_str()).unwrap_or("?");
                    println!("  - {id} [{status}] {task}");
                }
            }
            Err(_) => {}
        },
        Err(_) => {}
    }

    Ok(())
}

fn cmd_logs(project_dir: &Path, agent: &str, tail: usize) -> Result<(), String> {
    let config = HomerConfig::load(project_dir).map_err(|e| e.to_string())?;
    let slug = paths::repo_slug(config.project.repo.as_deref(), project_dir);

    let content = std::fs::read_to_string(paths::session_path(&slug))
        .map_err(|_| format!("no saved session found for this project (slug '{slug}')"))?;
    let snapshot: serde_json::Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    let agents = snapshot.get("agents").and_then(|a| a.as_array()).cloned().unwrap_or_default();
    let found = agents
        .iter()
        .find(|a| a.get("id").and_then(|v| v.as_str()) == Some(agent))
        .ok_or_else(|| format!("no persisted output for agent '{agent}'"))?;
    let output_tail = found.get("outputTail").and_then(|v| v.as_str()).unwrap_or("");

    let lines: Vec<&str> = output_tail.lines().collect();
    let start = lines.len().saturating_sub(tail);
    for line in &lines[start..] {
        println!("{line}");
    }
    Ok(())
}

fn cmd_export(project_dir: &Path, output: Option<PathBuf>, git_commits: usize) -> Result<(), String> {
    let output_dir = output.unwrap_or_else(|| project_dir.join(".homer/export"));
    let manifest = export::export_project(project_dir, &output_dir, git_commits).map_err(|e| e.to_string())?;

    println!("Exported to {}", output_dir.display());
    println!();
    println!(
        "Stories: {} total ({} passing, {} pending)",
        manifest.stories.total, manifest.stories.passing, manifest.stories.pending
    );
    println!(
        "Memory: {} solutions, {} rules, {} task runs",
        manifest.memory.solutions, manifest.memory.repo_rules, manifest.memory.task_runs
    );
    if let Some(git) = &manifest.git {
        println!(
            "Git: {} commit(s) included, branch {}",
            git.commits_included,
            git.branch.as_deref().unwrap_or("?")
        );
    }
    println!();
    println!("Manifest: {}", output_dir.join("manifest.json").display());
    Ok(())
}
