//! Merge queue commands.

use anyhow::Result;
use convoy::audit::{AuditEventKind, AuditLog};
use convoy::config::ProjectContext;
use convoy::lock::LockManager;
use convoy::queue::daemon::MergeDaemon;
use convoy::queue::{MergeKind, MergeQueue, QueueEntry};
use convoy::session::TmuxHost;
use convoy::store::OperationStore;
use convoy::tracker::GhTracker;
use convoy::workspace::WorkspaceProvisioner;
use std::sync::Arc;

fn open_queue(ctx: &ProjectContext) -> MergeQueue {
    let holder = format!("cli@{}", ctx.host);
    MergeQueue::new(
        ctx.queue_file.clone(),
        LockManager::new(ctx.locks_dir.clone(), &holder),
    )
}

pub fn cmd_queue_add(
    ctx: &ProjectContext,
    target: &str,
    priority: i64,
    as_branch: bool,
) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let queue = open_queue(ctx);

    let entry = if as_branch {
        QueueEntry::new(
            target,
            ctx.project_dir.clone(),
            priority,
            MergeKind::Branch,
        )
    } else {
        let store = OperationStore::new(ctx.store_dir.clone());
        let op = store
            .load(target)?
            .ok_or_else(|| anyhow::anyhow!("No operation named '{}'", target))?;
        let workspace = op.worktree.unwrap_or_else(|| {
            WorkspaceProvisioner::new(ctx).workspace_path(target)
        });
        let mut entry = QueueEntry::new(target, workspace, priority, MergeKind::Operation);
        entry.issue_id = op.issue_id;
        entry
    };

    queue.enqueue(entry)?;
    AuditLog::new(ctx.audit_dir.clone()).append(
        target,
        AuditEventKind::Enqueued { priority },
        None,
    )?;
    println!("Enqueued '{}' at priority {}", target, priority);
    Ok(())
}

pub fn cmd_queue_show(ctx: &ProjectContext) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let entries = open_queue(ctx).entries()?;
    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for entry in entries {
        let mut notes = Vec::new();
        if entry.attempts > 0 {
            notes.push(format!("attempts {}", entry.attempts));
        }
        if entry.stuck {
            notes.push("stuck".to_string());
        }
        if let Some(reason) = &entry.reason {
            notes.push(reason.clone());
        }
        let note_text = if notes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", notes.join("; "))
        };
        println!(
            "  {:<24} p{:<4} {:<10}{}",
            entry.operation,
            entry.priority,
            entry.status.to_string(),
            console::style(note_text).yellow()
        );
    }
    Ok(())
}

pub async fn cmd_queue_prune(ctx: &ProjectContext) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let before = open_queue(ctx).entries()?.len();
    let daemon = MergeDaemon::new(
        ctx,
        Arc::new(GhTracker::new(&ctx.gh_cmd)),
        Arc::new(TmuxHost::new(&ctx.tmux_cmd)),
    );
    daemon.prune().await?;
    let after = open_queue(ctx).entries()?.len();
    println!("Pruned {} entries ({} remain)", before - after, after);
    Ok(())
}
