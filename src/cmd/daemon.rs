//! Long-running daemon commands. These are the only commands that install
//! a tracing subscriber; one-shot commands print directly.

use anyhow::Result;
use convoy::config::ProjectContext;
use convoy::queue::daemon::MergeDaemon;
use convoy::session::TmuxHost;
use convoy::tracker::GhTracker;
use convoy::worker::WorkerKind;
use convoy::worker::daemon::WorkerDaemon;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn cmd_merge_daemon(ctx: &ProjectContext, verbose: bool) -> Result<()> {
    super::ensure_initialized(ctx)?;
    init_tracing(verbose);
    let daemon = MergeDaemon::new(
        ctx,
        Arc::new(GhTracker::new(&ctx.gh_cmd)),
        Arc::new(TmuxHost::new(&ctx.tmux_cmd)),
    );
    daemon.run().await
}

pub async fn cmd_worker(ctx: &ProjectContext, kind: &str, verbose: bool) -> Result<()> {
    super::ensure_initialized(ctx)?;
    init_tracing(verbose);
    let kind: WorkerKind = kind.parse()?;
    let daemon = WorkerDaemon::new(
        ctx,
        kind,
        Arc::new(GhTracker::new(&ctx.gh_cmd)),
        Arc::new(TmuxHost::new(&ctx.tmux_cmd)),
    );
    daemon.run().await?;
    Ok(())
}
