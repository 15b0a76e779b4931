//! The merge daemon: readiness gating, the integration protocol, crash
//! recovery, and pruning.
//!
//! One cycle selects the first entry in dequeue order that passes every
//! readiness gate and integrates it under the merge lock. Entries caught
//! mid-processing by a crash are reconciled at startup against the actual
//! git history, never against what the queue file claims happened.

use crate::audit::{AuditEventKind, AuditLog};
use crate::config::ProjectContext;
use crate::errors::LockError;
use crate::lock::{LockManager, MERGE_LOCK};
use crate::op::{Phase, StateMachine};
use crate::queue::{
    EntryStatus, MAX_CONFLICT_RETRIES, MAX_OPEN_ISSUE_CHECKS, MergeKind, MergeQueue, QueueEntry,
    dequeue_order,
};
use crate::session::SessionHost;
use crate::store::OperationStore;
use crate::tracker::IssueTracker;
use crate::workspace::{MergeOutcome, WorkspaceProvisioner};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pruning runs on its own cadence, independent of the poll interval.
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Why an entry was passed over this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked(String),
}

pub struct MergeDaemon {
    ctx: ProjectContext,
    store: OperationStore,
    audit: AuditLog,
    queue: MergeQueue,
    workspace: WorkspaceProvisioner,
    locks: LockManager,
    tracker: Arc<dyn IssueTracker>,
    session: Arc<dyn SessionHost>,
}

impl MergeDaemon {
    pub fn new(
        ctx: &ProjectContext,
        tracker: Arc<dyn IssueTracker>,
        session: Arc<dyn SessionHost>,
    ) -> Self {
        let holder = format!("merge-daemon@{}", ctx.host);
        Self {
            store: OperationStore::new(ctx.store_dir.clone()),
            audit: AuditLog::new(ctx.audit_dir.clone()),
            queue: MergeQueue::new(
                ctx.queue_file.clone(),
                LockManager::new(ctx.locks_dir.clone(), &holder),
            ),
            workspace: WorkspaceProvisioner::new(ctx),
            locks: LockManager::new(ctx.locks_dir.clone(), &holder),
            tracker,
            session,
            ctx: ctx.clone(),
        }
    }

    fn machine(&self) -> StateMachine<'_> {
        StateMachine::new(&self.store, &self.audit)
    }

    /// Supervision loop. Recovers interrupted work once, then polls.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_secs = self.ctx.queue_poll_secs,
            "merge daemon starting"
        );
        self.recover().await?;
        if let Err(e) = self.prune().await {
            warn!(error = %e, "startup prune failed");
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.ctx.queue_poll_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_prune = std::time::Instant::now();
        loop {
            ticker.tick().await;
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "merge cycle failed");
            }
            if last_prune.elapsed() >= PRUNE_INTERVAL {
                if let Err(e) = self.prune().await {
                    warn!(error = %e, "prune failed");
                }
                last_prune = std::time::Instant::now();
            }
        }
    }

    /// Reconcile entries a previous process left in `processing` against the
    /// repository. The queue file says a merge was underway; only the git
    /// history knows whether it landed.
    pub async fn recover(&self) -> Result<()> {
        let entries = self.queue.entries()?;
        for entry in entries
            .iter()
            .filter(|e| e.status == EntryStatus::Processing)
        {
            let branch = self.branch_for(entry)?;
            let merged = match self.workspace.branch_is_ancestor(&branch) {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(
                        operation = %entry.operation,
                        error = %e,
                        "ancestry check failed during recovery, resetting entry"
                    );
                    false
                }
            };
            if merged {
                info!(operation = %entry.operation, "finalizing merge interrupted after landing");
                self.queue
                    .update(&entry.operation, |e| e.status = EntryStatus::Completed)?;
                if entry.merge_kind == MergeKind::Operation {
                    self.machine().transition(&entry.operation, Phase::Merged)?;
                }
                self.audit.append(
                    &entry.operation,
                    AuditEventKind::Merged,
                    Some("finalized after restart".into()),
                )?;
            } else {
                info!(operation = %entry.operation, "resetting merge interrupted before landing");
                self.queue
                    .update(&entry.operation, |e| e.status = EntryStatus::Pending)?;
            }
        }
        Ok(())
    }

    /// One poll cycle: attempt the first ready entry in dequeue order.
    /// Blocked entries do not stall those behind them.
    pub async fn cycle(&self) -> Result<()> {
        let entries = self.queue.entries()?;
        for entry in dequeue_order(&entries) {
            match self.evaluate(entry).await? {
                Readiness::Ready => {
                    self.process(entry).await?;
                    return Ok(());
                }
                Readiness::Blocked(reason) => {
                    debug!(operation = %entry.operation, %reason, "entry not ready");
                }
            }
        }
        Ok(())
    }

    /// Readiness gates for one entry. Every gate must pass in the same
    /// cycle; a blocked entry is re-evaluated from scratch next time.
    pub async fn evaluate(&self, entry: &QueueEntry) -> Result<Readiness> {
        if entry.merge_kind == MergeKind::Branch {
            // Bare branch merges carry no operation lifecycle; the merge
            // itself is the only arbiter.
            return Ok(Readiness::Ready);
        }

        let Some(op) = self.store.load(&entry.operation)? else {
            return Ok(Readiness::Blocked("no operation record".into()));
        };
        if !op.merge_ok {
            return Ok(Readiness::Blocked("not flagged merge-ready".into()));
        }
        if !entry.workspace.exists() {
            return Ok(Readiness::Blocked("workspace missing".into()));
        }
        if let Some(session) = &op.session
            && self.session.exists(session).await?
        {
            return Ok(Readiness::Blocked("agent session still running".into()));
        }
        if let Some(issue_id) = entry.issue_id {
            if !self.tracker.is_closed(issue_id).await? {
                let updated = self.queue.update(&entry.operation, |e| {
                    e.open_issue_checks += 1;
                    if e.open_issue_checks >= MAX_OPEN_ISSUE_CHECKS {
                        e.stuck = true;
                        e.reason = Some(format!("issue #{} still open", issue_id));
                    }
                })?;
                if updated.stuck {
                    warn!(
                        operation = %entry.operation,
                        issue = issue_id,
                        "entry parked: issue remained open after recheck"
                    );
                }
                return Ok(Readiness::Blocked(format!("issue #{} open", issue_id)));
            }
            if entry.open_issue_checks > 0 {
                self.queue
                    .update(&entry.operation, |e| e.open_issue_checks = 0)?;
            }
        }
        if !self.workspace.is_clean(&entry.workspace)? {
            return Ok(Readiness::Blocked("workspace has uncommitted changes".into()));
        }
        Ok(Readiness::Ready)
    }

    fn branch_for(&self, entry: &QueueEntry) -> Result<String> {
        match entry.merge_kind {
            MergeKind::Branch => Ok(entry.operation.clone()),
            MergeKind::Operation => Ok(self
                .store
                .load(&entry.operation)?
                .and_then(|op| op.branch)
                .unwrap_or_else(|| self.workspace.branch_name(&entry.operation))),
        }
    }

    /// Integrate one ready entry under the merge lock. A held lock is not
    /// an error: another daemon got there first, we try again next cycle.
    async fn process(&self, entry: &QueueEntry) -> Result<()> {
        let _merge_guard = match self.locks.try_acquire(MERGE_LOCK) {
            Ok(guard) => guard,
            Err(LockError::Held { pid, .. }) => {
                debug!(pid, "merge lock held elsewhere, skipping cycle");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let branch = self.branch_for(entry)?;
        self.queue
            .update(&entry.operation, |e| e.status = EntryStatus::Processing)?;
        self.audit
            .append(&entry.operation, AuditEventKind::MergeStarted, None)?;
        info!(operation = %entry.operation, %branch, "merging");

        match self.workspace.merge_into_integration(&branch).await? {
            MergeOutcome::Merged => self.finish_merged(entry, &branch).await,
            MergeOutcome::Conflict => self.record_conflict(entry).await,
            MergeOutcome::Failed(reason) => self.record_failure(entry, reason).await,
        }
    }

    async fn finish_merged(&self, entry: &QueueEntry, branch: &str) -> Result<()> {
        if self.workspace.has_remote() {
            if let Err(e) = self.workspace.push_integration().await {
                // The merge landed locally but did not publish; treat the
                // entry as failed so an operator reconciles before anything
                // else builds on top.
                return self
                    .record_failure(entry, format!("push rejected: {e}"))
                    .await;
            }
        }

        self.queue
            .update(&entry.operation, |e| e.status = EntryStatus::Completed)?;
        self.audit
            .append(&entry.operation, AuditEventKind::Merged, None)?;
        info!(operation = %entry.operation, %branch, "merged");

        if entry.merge_kind == MergeKind::Branch {
            return Ok(());
        }

        let op = self.machine().transition(&entry.operation, Phase::Merged)?;
        if op.kind.delete_branch_on_merge() {
            if self.workspace.has_remote()
                && let Err(e) = self.workspace.delete_remote_branch(branch).await
            {
                warn!(%branch, error = %e, "remote branch cleanup failed");
            }
            if let Some(worktree) = &op.worktree
                && worktree.exists()
                && let Err(e) = self.workspace.remove(worktree).await
            {
                warn!(worktree = %worktree.display(), error = %e, "worktree cleanup failed");
            }
        }
        self.resume_dependents(&entry.operation).await?;
        Ok(())
    }

    /// Held operations waiting on the just-merged one resume automatically.
    async fn resume_dependents(&self, merged: &str) -> Result<()> {
        for op in self.store.list()? {
            if op.held && op.after.as_deref() == Some(merged) {
                match self.machine().resume(&op.name, false) {
                    Ok(_) => info!(operation = %op.name, after = merged, "dependent resumed"),
                    Err(e) => {
                        warn!(operation = %op.name, error = %e, "dependent resume failed")
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_conflict(&self, entry: &QueueEntry) -> Result<()> {
        let updated = self.queue.update(&entry.operation, |e| {
            e.attempts += 1;
            e.status = EntryStatus::Conflict;
            e.reason = Some("merge conflict".into());
        })?;
        self.audit.append(
            &entry.operation,
            AuditEventKind::MergeConflict,
            Some(format!("attempt {}", updated.attempts)),
        )?;

        if updated.attempts > MAX_CONFLICT_RETRIES && entry.merge_kind == MergeKind::Operation {
            warn!(operation = %entry.operation, "conflict persisted after retry, needs manual rebase");
            // Conflict is the one sanctioned backward move out of
            // pending_merge, applied only while holding the merge lock.
            self.store.update(&entry.operation, |op| {
                op.phase = Phase::Conflict;
                op.merge_ok = false;
                op.reason = Some("merge conflict persisted after retry".into());
            })?;
        } else {
            info!(operation = %entry.operation, "merge conflicted, will retry once");
        }
        Ok(())
    }

    async fn record_failure(&self, entry: &QueueEntry, reason: String) -> Result<()> {
        warn!(operation = %entry.operation, %reason, "merge failed");
        self.queue.update(&entry.operation, |e| {
            e.status = EntryStatus::Failed;
            e.reason = Some(reason.clone());
        })?;
        self.audit.append(
            &entry.operation,
            AuditEventKind::MergeFailed,
            Some(reason.clone()),
        )?;
        if entry.merge_kind == MergeKind::Operation {
            self.store.update(&entry.operation, |op| {
                op.phase = Phase::Failed;
                op.merge_ok = false;
                op.reason = Some(reason);
            })?;
        }
        Ok(())
    }

    /// Two pruning passes: terminal entries past retention, and pending
    /// entries with no backing state anywhere.
    pub async fn prune(&self) -> Result<()> {
        let retention = chrono::Duration::hours(self.ctx.retention_hours as i64);
        for removed in self.queue.prune_aged(retention)? {
            self.audit.append(
                &removed.operation,
                AuditEventKind::Pruned,
                Some("past retention".into()),
            )?;
            debug!(operation = %removed.operation, "pruned aged entry");
        }

        if !self.workspace.has_remote() {
            return Ok(());
        }
        let entries = self.queue.entries()?;
        for entry in entries.iter().filter(|e| {
            e.status == EntryStatus::Pending && e.merge_kind == MergeKind::Operation && !e.stuck
        }) {
            if self.store.load(&entry.operation)?.is_some() {
                continue;
            }
            let branch = self.workspace.branch_name(&entry.operation);
            match self.workspace.remote_branch_exists(&branch).await {
                Ok(false) => {
                    // Confirmed absent on both sides: nothing left to merge.
                    self.queue
                        .remove_where(|e| e.operation == entry.operation)?;
                    self.audit.append(
                        &entry.operation,
                        AuditEventKind::Pruned,
                        Some("no backing state".into()),
                    )?;
                    info!(operation = %entry.operation, "pruned orphaned entry");
                }
                Ok(true) => {}
                Err(e) => {
                    // Ambiguous: the check failed, the branch may well
                    // exist. Never prune on a transient remote error.
                    warn!(operation = %entry.operation, error = %e, "remote check failed, keeping entry");
                }
            }
        }
        Ok(())
    }
}
