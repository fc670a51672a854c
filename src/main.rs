// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gatehouse main entry point - CLI over the control plane.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;

use gatehouse::checkpoint::RestoreOutcome;
use gatehouse::config::{self, CliOptions, ResolvedConfig};
use gatehouse::guard::{Guard, GuardContext, Verdict};
use gatehouse::session::SessionService;
#[cfg(feature = "telemetry")]
use gatehouse::telemetry::GLOBAL_METRICS;
use gatehouse::telemetry::{init_telemetry, TelemetryConfig};
use gatehouse::vcs::discover_repo_root;
use gatehouse::workspace::{
    format_age, sanitize_branch_name, LockState, ReconcileReport, ReconcileTrigger, Workspace,
};

/// Gatehouse version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when a command needs human confirmation.
const EXIT_CONFIRM: u8 = 3;

/// Gatehouse - workspace isolation and command policy for coding agents.
#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(author, version, about = "Workspace isolation and command policy for coding agents", long_about = None)]
struct Cli {
    /// Repository root (defaults to the repository containing the current directory)
    #[arg(long, global = true, env = "GATEHOUSE_REPO")]
    repo: Option<PathBuf>,

    /// Protected integration branch
    #[arg(long, global = true, env = "GATEHOUSE_PROTECTED_BRANCH")]
    protected_branch: Option<String>,

    /// Directory holding one worktree per workspace
    #[arg(long, global = true)]
    isolation_root: Option<PathBuf>,

    /// State directory (registry, sessions, locks)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Hours after which an untouched lock is stale
    #[arg(long, global = true)]
    stale_after_hours: Option<u64>,

    /// Writes between automatic checkpoints
    #[arg(long, global = true)]
    checkpoint_every: Option<u32>,

    /// Output format
    #[arg(short = 'f', long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Show info-level logs
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Subcommands for gatehouse.
#[derive(Subcommand)]
enum Commands {
    /// Classify a shell command (exit 0 allow/rewrite, 2 deny, 3 confirm)
    Guard {
        /// Command to classify; read from stdin when omitted
        command: Option<String>,
        /// Directory the command will run in
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Branch checked out in the working directory
        #[arg(long)]
        branch: Option<String>,
        /// Treat the working directory as a workspace root even if unregistered
        #[arg(long)]
        in_workspace: bool,
    },

    /// Manage isolated workspaces
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },

    /// Bring filesystem, worktree list and registry back in line
    Reconcile {
        /// Report what would change without changing it
        #[arg(long)]
        dry_run: bool,
        /// Fail when drift remains afterwards
        #[arg(long)]
        strict: bool,
    },

    /// Manage agent sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage working-tree checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Create a workspace for a branch
    Create {
        branch: String,
        /// Issue or ticket the workspace is for
        #[arg(long)]
        issue: Option<String>,
    },
    /// List registered workspaces
    List,
    /// Show one workspace (by id or branch)
    Lookup { workspace: String },
    /// Refresh a held lock
    Heartbeat {
        workspace: String,
        #[arg(long)]
        session: String,
    },
    /// Release a lock
    Release {
        workspace: String,
        #[arg(long, required_unless_present = "force")]
        session: Option<String>,
        /// Remove the marker regardless of holder
        #[arg(long)]
        force: bool,
    },
    /// Remove a workspace's worktree, registry entry and lock
    Remove {
        workspace: String,
        #[arg(long)]
        session: Option<String>,
        /// Remove even if locked or dirty
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session on a branch
    Start {
        branch: String,
        #[arg(long)]
        issue: Option<String>,
    },
    /// End a session and release its lock
    End { session: String },
    /// Clean up after a branch was merged
    Merged { branch: String },
    /// Record a file write (may trigger a checkpoint)
    Write { session: String, file: PathBuf },
    /// List sessions
    List {
        /// Include ended sessions
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Take a checkpoint of a session's worktree now
    Create {
        session: String,
        /// File whose change prompted the checkpoint
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List checkpoints of a branch
    List { branch: String },
    /// Restore a checkpoint into a session's worktree
    Restore {
        session: String,
        sequence: u64,
        /// Session epoch the checkpoint belongs to (defaults to the latest)
        #[arg(long)]
        epoch: Option<i64>,
        /// Proceed even if uncaptured work would be lost
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Delete all checkpoints of a branch
    Prune { branch: String },
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(&TelemetryConfig::from_verbosity(cli.verbose, cli.debug))?;

    let cwd = std::env::current_dir()?;
    let repo_root = match &cli.repo {
        Some(repo) => repo.clone(),
        None => discover_repo_root(&cwd).unwrap_or_else(|| cwd.clone()),
    };
    let cli_options = CliOptions {
        protected_branch: cli.protected_branch.clone(),
        isolation_root: cli.isolation_root.clone(),
        state_dir: cli.state_dir.clone(),
        stale_after_hours: cli.stale_after_hours,
        checkpoint_every: cli.checkpoint_every,
    };
    let format = cli.format;
    let debug = cli.debug;

    let result = match cli.command {
        Commands::Init => {
            let path = config::init_config(&repo_root, None)?;
            println!("Created config file: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => {
            println!("gatehouse {}", VERSION);
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let config = config::load_config(&repo_root, cli_options)
                .with_context(|| format!("loading configuration for {}", repo_root.display()))?;
            run(command, &repo_root, &cwd, &config, format).await
        }
    };

    #[cfg(feature = "telemetry")]
    if debug {
        eprintln!("{}", GLOBAL_METRICS.snapshot().format_report());
    }
    #[cfg(not(feature = "telemetry"))]
    let _ = debug;

    result
}

async fn run(
    command: Commands,
    repo_root: &Path,
    cwd: &Path,
    config: &ResolvedConfig,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let service = SessionService::open(repo_root, config);
    match command {
        Commands::Guard {
            command,
            cwd: guard_cwd,
            branch,
            in_workspace,
        } => {
            let command = match command {
                Some(command) => command,
                None => {
                    let mut input = String::new();
                    std::io::stdin().read_to_string(&mut input)?;
                    input.trim_end().to_string()
                }
            };
            let guard_cwd = guard_cwd.unwrap_or_else(|| cwd.to_path_buf());
            let ctx = guard_context(&service, guard_cwd, branch, in_workspace).await?;
            let verdict = Guard::from_config(config)?.check(&command, &ctx);
            emit(format, &verdict, || print_verdict(&verdict))?;
            Ok(ExitCode::from(verdict.exit_code() as u8))
        }
        Commands::Workspace { action } => handle_workspace(&service, action, format).await,
        Commands::Reconcile { dry_run, strict } => {
            let report = service.reconcile(ReconcileTrigger::Manual, dry_run).await?;
            emit(format, &report, || print_report(&report))?;
            if strict {
                report.ensure_clean()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Session { action } => handle_session(&service, action, format).await,
        Commands::Checkpoint { action } => handle_checkpoint(&service, action, format).await,
        Commands::Config { action } => {
            match action {
                Some(ConfigAction::Show) | None => {
                    println!("{}", serde_json::to_string_pretty(config)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init | Commands::Version => Ok(ExitCode::SUCCESS),
    }
}

/// Build the guard context for a command about to run in `cwd`.
async fn guard_context(
    service: &SessionService,
    cwd: PathBuf,
    branch: Option<String>,
    in_workspace: bool,
) -> anyhow::Result<GuardContext> {
    let workspace_root = match service.workspaces().containing(&cwd)? {
        Some(workspace) => Some(workspace.path),
        None if in_workspace => Some(cwd.clone()),
        None => None,
    };
    let branch = match branch {
        Some(branch) => Some(branch),
        None => service.vcs().current_branch(&cwd).await.ok().flatten(),
    };

    let mut ctx = GuardContext::new(cwd);
    ctx.workspace_root = workspace_root;
    ctx.current_branch = branch;
    ctx.home = dirs::home_dir();
    Ok(ctx)
}

async fn handle_workspace(
    service: &SessionService,
    action: WorkspaceAction,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let workspaces = service.workspaces();
    match action {
        WorkspaceAction::Create { branch, issue } => {
            let workspace = workspaces.create(&branch, issue.as_deref()).await?;
            emit(format, &workspace, || {
                println!("{} {}", "Created".green(), workspace.path.display());
            })?;
        }
        WorkspaceAction::List => {
            let list = workspaces.list()?;
            emit(format, &list, || {
                if list.is_empty() {
                    println!("{}", "No workspaces".dimmed());
                }
                for workspace in &list {
                    print_workspace(workspace);
                }
            })?;
        }
        WorkspaceAction::Lookup { workspace } => {
            let id = resolve_id(&workspace);
            let found = workspaces
                .lookup(&id)?
                .with_context(|| format!("no workspace {id}"))?;
            emit(format, &found, || print_workspace(&found))?;
        }
        WorkspaceAction::Heartbeat { workspace, session } => {
            workspaces.locks().heartbeat(&resolve_id(&workspace), &session)?;
        }
        WorkspaceAction::Release {
            workspace,
            session,
            force,
        } => {
            let id = resolve_id(&workspace);
            match session {
                Some(session) if !force => workspaces.locks().release(&id, &session)?,
                _ => {
                    if !workspaces.locks().force_release(&id)? {
                        println!("{}", format!("{id} was not locked").dimmed());
                    }
                }
            }
        }
        WorkspaceAction::Remove {
            workspace,
            session,
            force,
        } => {
            let id = resolve_id(&workspace);
            workspaces.remove(&id, session.as_deref(), force).await?;
            if format == OutputFormat::Text {
                println!("{} {}", "Removed".green(), id);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_session(
    service: &SessionService,
    action: SessionAction,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    match action {
        SessionAction::Start { branch, issue } => {
            let started = service.start(&branch, issue.as_deref()).await?;
            let value = serde_json::json!({
                "session": started.session,
                "workspace": started.workspace,
                "acquired": format!("{:?}", started.acquired).to_lowercase(),
                "reconcile": started.reconcile,
            });
            emit(format, &value, || {
                if !started.reconcile.is_clean() {
                    print_report(&started.reconcile);
                }
                println!("{} {}", "Session".green(), started.session.id.bold());
                println!("  workspace: {}", started.workspace.path.display());
                println!("  branch:    {}", started.session.branch);
            })?;
        }
        SessionAction::End { session } => {
            let ended = service.end(&session)?;
            emit(format, &ended, || println!("{} {}", "Ended".green(), ended.id))?;
        }
        SessionAction::Merged { branch } => {
            let outcome = service.complete_merge(&branch).await?;
            let value = serde_json::json!({
                "workspace": outcome.workspace_id,
                "ended": outcome.ended,
                "pruned": outcome.pruned,
                "removed": outcome.removed,
                "reconcile": outcome.reconcile,
            });
            emit(format, &value, || {
                println!(
                    "{} {}: {} session(s) ended, {} checkpoint(s) pruned, workspace {}",
                    "Merged".green(),
                    branch,
                    outcome.ended.len(),
                    outcome.pruned,
                    if outcome.removed { "removed" } else { "kept" }
                );
                if !outcome.reconcile.is_clean() {
                    print_report(&outcome.reconcile);
                }
            })?;
        }
        SessionAction::Write { session, file } => {
            let checkpoint = service.record_write(&session, &file).await?;
            emit(format, &checkpoint, || {
                if let Some(cp) = &checkpoint {
                    println!("{} #{} {}", "Checkpoint".cyan(), cp.sequence, cp.reference.dimmed());
                }
            })?;
        }
        SessionAction::List { all } => {
            let sessions: Vec<_> = service
                .storage()
                .list()?
                .into_iter()
                .filter(|s| all || s.is_active())
                .collect();
            emit(format, &sessions, || {
                for s in &sessions {
                    let state = if s.is_active() { "active".green() } else { "ended".dimmed() };
                    println!("{:<40} {:<24} {:<8} #{}", s.id, s.workspace_id, state, s.checkpoint_counter);
                }
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_checkpoint(
    service: &SessionService,
    action: CheckpointAction,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    match action {
        CheckpointAction::Create { session, file } => {
            let cp = service.checkpoint(&session, file.as_deref()).await?;
            emit(format, &cp, || println!("{} #{} {}", "Checkpoint".cyan(), cp.sequence, cp.reference))?;
        }
        CheckpointAction::List { branch } => {
            let list = service.checkpoints().list(&branch).await?;
            emit(format, &list, || {
                if list.is_empty() {
                    println!("{}", format!("No checkpoints for {branch}").dimmed());
                }
                for cp in &list {
                    let target = cp
                        .target_file
                        .as_ref()
                        .map(|f| f.display().to_string())
                        .unwrap_or_default();
                    println!("{:>4} {:>14} {} {}", cp.sequence, cp.epoch, &cp.object_id[..cp.object_id.len().min(12)], target);
                }
            })?;
        }
        CheckpointAction::Restore {
            session,
            sequence,
            epoch,
            yes,
        } => {
            let outcome = service.restore(&session, sequence, epoch, yes).await?;
            emit(format, &outcome, || match &outcome {
                RestoreOutcome::ConfirmationRequired { plan } => {
                    println!(
                        "{} restoring #{} ({}) would discard uncaptured changes; rerun with --yes",
                        "CONFIRM".yellow().bold(),
                        sequence,
                        plan.diff
                    );
                }
                RestoreOutcome::Restored { plan, safety_ref } => {
                    println!("{} #{} ({})", "Restored".green(), sequence, plan.diff);
                    if let Some(safety) = safety_ref {
                        println!("  previous state saved as {}", safety.dimmed());
                    }
                }
            })?;
            if matches!(outcome, RestoreOutcome::ConfirmationRequired { .. }) {
                return Ok(ExitCode::from(EXIT_CONFIRM));
            }
        }
        CheckpointAction::Prune { branch } => {
            let removed = service.checkpoints().prune(&branch).await?;
            emit(format, &serde_json::json!({ "pruned": removed }), || {
                println!("{} {} checkpoint ref(s)", "Pruned".green(), removed);
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Workspace id from an id or a branch name.
fn resolve_id(workspace: &str) -> String {
    sanitize_branch_name(workspace)
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(),
    }
    Ok(())
}

fn print_verdict(verdict: &Verdict) {
    match verdict {
        Verdict::Allow => println!("{}", "ALLOW".green()),
        Verdict::Deny {
            rule,
            tier,
            reason,
            suggestion,
        } => {
            println!("{} [{}/{}] {}", "DENY".red().bold(), tier, rule, reason);
            if let Some(suggestion) = suggestion {
                println!("  try: {}", suggestion.cyan());
            }
        }
        Verdict::Rewrite { command, reason, .. } => {
            eprintln!("{} {}", "REWRITE".yellow(), reason.dimmed());
            println!("{command}");
        }
        Verdict::Confirm { prompt, command, .. } => {
            println!("{} {}", "CONFIRM".yellow().bold(), prompt);
            println!("  command: {command}");
        }
    }
}

fn print_workspace(workspace: &Workspace) {
    let lock = match &workspace.lock_state {
        LockState::Unlocked => "unlocked".dimmed(),
        LockState::Active { holder } => format!("locked by {holder}").green(),
        LockState::Stale { holder, age_secs } => format!(
            "stale ({} ago, {holder})",
            format_age(std::time::Duration::from_secs(*age_secs))
        )
        .yellow(),
    };
    println!(
        "{:<32} {:<32} {}",
        workspace.id.bold(),
        workspace.branch,
        lock
    );
}

fn print_report(report: &ReconcileReport) {
    let text = report.to_string();
    if report.is_clean() {
        print!("{text}");
    } else {
        print!("{}", text.yellow());
    }
}
