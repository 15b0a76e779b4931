use anyhow::Result;
use clap::{Parser, Subcommand};
use convoy::config::ProjectContext;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version, about = "Merge-queue orchestrator for autonomous coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a convoy project in the current directory
    Init,
    /// Register a new operation
    Submit {
        name: String,
        /// plan, feature, fix, chore, roadmap, or goal
        #[arg(long, default_value = "feature")]
        kind: String,
        /// Operation that must merge before this one may resume
        #[arg(long)]
        after: Option<String>,
        /// Instructions recorded for the agent
        #[arg(long)]
        prompt: Option<String>,
        /// Create the worktree and branch immediately
        #[arg(long)]
        provision: bool,
    },
    /// Show operations, queue counts, and lock holders
    Status,
    /// Pause an operation without losing its place
    Hold { name: String },
    /// Release a held operation
    Resume {
        name: String,
        /// Resume even while the `after` dependency is unmerged
        #[arg(long)]
        force: bool,
    },
    /// Cancel an operation permanently
    Cancel { name: String },
    /// Show the audit history of an operation
    Audit { name: String },
    /// Inspect or edit the merge queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Run the merge daemon in the foreground
    MergeDaemon,
    /// Run a worker daemon (fix or chore) in the foreground
    Worker { kind: String },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Enqueue an operation (or a bare branch) for integration
    Add {
        target: String,
        /// Lower merges first
        #[arg(short, long, default_value = "0")]
        priority: i64,
        /// Treat the target as a branch name rather than an operation
        #[arg(long)]
        branch: bool,
    },
    /// List queue entries
    Show,
    /// Remove aged and orphaned entries now
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = ProjectContext::resolve(cli.project_dir.clone())?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&ctx)?,
        Commands::Submit {
            name,
            kind,
            after,
            prompt,
            provision,
        } => {
            cmd::cmd_submit(
                &ctx,
                name,
                kind,
                after.as_deref(),
                prompt.as_deref(),
                *provision,
            )
            .await?
        }
        Commands::Status => cmd::cmd_status(&ctx)?,
        Commands::Hold { name } => cmd::cmd_hold(&ctx, name)?,
        Commands::Resume { name, force } => cmd::cmd_resume(&ctx, name, *force)?,
        Commands::Cancel { name } => cmd::cmd_cancel(&ctx, name)?,
        Commands::Audit { name } => cmd::cmd_audit(&ctx, name)?,
        Commands::Queue { command } => match command {
            QueueCommands::Add {
                target,
                priority,
                branch,
            } => cmd::cmd_queue_add(&ctx, target, *priority, *branch)?,
            QueueCommands::Show => cmd::cmd_queue_show(&ctx)?,
            QueueCommands::Prune => cmd::cmd_queue_prune(&ctx).await?,
        },
        Commands::MergeDaemon => cmd::cmd_merge_daemon(&ctx, cli.verbose).await?,
        Commands::Worker { kind } => cmd::cmd_worker(&ctx, kind, cli.verbose).await?,
    }
    Ok(())
}
