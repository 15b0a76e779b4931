//! The worker daemon: poll the tracker, claim one item, run an agent on it
//! in an isolated workspace, then classify the outcome.
//!
//! Outcome classification hinges on the completion sentinel the agent
//! writes on clean exit:
//!   - sentinel and commits: push and hand the branch to the merge queue
//!   - sentinel but no commits: the agent decided a human must take over
//!   - no sentinel: the session crashed; back off, alert, and stop the
//!     worker entirely on the second consecutive crash

use crate::audit::{AuditEventKind, AuditLog};
use crate::config::ProjectContext;
use crate::errors::WorkerError;
use crate::lock::LockManager;
use crate::op::{Operation, Phase, StateMachine};
use crate::queue::{MergeKind, MergeQueue, QueueEntry};
use crate::session::SessionHost;
use crate::store::OperationStore;
use crate::tracker::{IssueTracker, WorkItem};
use crate::worker::{
    MAX_CONSECUTIVE_FAILURES, SENTINEL_FILE, WorkerKind, WorkerState, backoff_delay,
};
use crate::workspace::WorkspaceProvisioner;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What one poll accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No claimable work.
    Idle,
    /// Work finished and enqueued for merge.
    Enqueued(String),
    /// Agent punted to a human; the item left the worker's queue.
    Handoff(String),
    /// Session died without the sentinel. Carries the failure streak.
    Crashed(u32),
}

/// One claimed item being executed.
struct ActiveItem {
    op_name: String,
    session: String,
    workspace: PathBuf,
    branch: String,
    issue: u64,
}

pub struct WorkerDaemon {
    ctx: ProjectContext,
    kind: WorkerKind,
    store: OperationStore,
    audit: AuditLog,
    queue: MergeQueue,
    workspace: WorkspaceProvisioner,
    tracker: Arc<dyn IssueTracker>,
    session: Arc<dyn SessionHost>,
    supervise_interval: Duration,
}

impl WorkerDaemon {
    pub fn new(
        ctx: &ProjectContext,
        kind: WorkerKind,
        tracker: Arc<dyn IssueTracker>,
        session: Arc<dyn SessionHost>,
    ) -> Self {
        let holder = format!("{}-worker@{}", kind, ctx.host);
        Self {
            store: OperationStore::new(ctx.store_dir.clone()),
            audit: AuditLog::new(ctx.audit_dir.clone()),
            queue: MergeQueue::new(
                ctx.queue_file.clone(),
                LockManager::new(ctx.locks_dir.clone(), &holder),
            ),
            workspace: WorkspaceProvisioner::new(ctx),
            tracker,
            session,
            kind,
            supervise_interval: Duration::from_secs(5),
            ctx: ctx.clone(),
        }
    }

    #[cfg(test)]
    fn with_supervise_interval(mut self, interval: Duration) -> Self {
        self.supervise_interval = interval;
        self
    }

    fn machine(&self) -> StateMachine<'_> {
        StateMachine::new(&self.store, &self.audit)
    }

    /// Polling loop. Returns only on self-stop or an unrecoverable error.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(kind = %self.kind, poll_secs = self.ctx.worker_poll_secs, "worker starting");
        loop {
            match self.poll_once().await {
                Ok(PollOutcome::Idle) => {}
                Ok(PollOutcome::Enqueued(op)) => info!(operation = %op, "work enqueued"),
                Ok(PollOutcome::Handoff(op)) => info!(operation = %op, "handed off to human"),
                Ok(PollOutcome::Crashed(failures)) => {
                    let delay = backoff_delay(failures);
                    warn!(failures, delay_secs = delay.as_secs(), "backing off after crash");
                    tokio::time::sleep(delay).await;
                }
                Err(e @ WorkerError::SelfStop { .. }) => {
                    error!(kind = %self.kind, error = %e, "worker stopping itself");
                    return Err(e);
                }
                Err(e) => warn!(kind = %self.kind, error = %e, "poll failed"),
            }
            tokio::time::sleep(Duration::from_secs(self.ctx.worker_poll_secs.max(1))).await;
        }
    }

    /// Claim one ready item, run the agent to completion, classify.
    pub async fn poll_once(&self) -> Result<PollOutcome, WorkerError> {
        let mut state = WorkerState::load(&self.ctx.workers_dir, self.kind)?;
        state.pid = Some(std::process::id());
        state.last_poll_at = Some(chrono::Utc::now());
        state.save(&self.ctx.workers_dir)?;

        let items = self.tracker.list_ready(self.kind.label()).await?;
        let mut claimed = None;
        for item in items {
            if self.tracker.claim(item.id, &self.ctx.host).await? {
                claimed = Some(item);
                break;
            }
            // Lost the race for this one, try the next.
        }
        let Some(item) = claimed else {
            return Ok(PollOutcome::Idle);
        };
        info!(kind = %self.kind, issue = item.id, title = %item.title, "claimed");

        let active = self.start_item(&item).await?;
        self.supervise(&active.session).await?;
        self.conclude(active).await
    }

    /// Create the operation, provision its workspace, launch the agent.
    async fn start_item(&self, item: &WorkItem) -> Result<ActiveItem, WorkerError> {
        let op_name = format!("{}-{}", self.kind, item.id);
        let session_name = format!("convoy-{}", op_name);

        if self.store.load(&op_name)?.is_none() {
            let mut op = Operation::new(&op_name, self.kind.op_kind());
            op.issue_id = Some(item.id);
            op.host = Some(self.ctx.host.clone());
            op.prompt = Some(prompt_for(item));
            op.labels = vec![self.kind.label().to_string()];
            self.machine().create(op)?;
        }

        let (workspace, branch) = self.workspace.provision(&op_name).await?;
        self.workspace.reset_to_integration_tip(&workspace).await?;
        let sentinel = workspace.join(SENTINEL_FILE);
        if sentinel.exists() {
            // Leftover from an earlier run of this item; a stale sentinel
            // would make a crash look like a clean exit.
            std::fs::remove_file(&sentinel).map_err(|e| WorkerError::Other(e.into()))?;
        }

        self.store.update(&op_name, |op| {
            op.worktree = Some(workspace.clone());
            op.branch = Some(branch.clone());
            op.session = Some(session_name.clone());
            op.host = Some(self.ctx.host.clone());
        })?;

        let command = format!(
            "{} {} && touch {}",
            self.ctx.agent_cmd,
            shell_quote(&prompt_for(item)),
            SENTINEL_FILE
        );
        self.session
            .launch(&session_name, &workspace, &command)
            .await
            .map_err(|e| WorkerError::SessionLaunch {
                session: session_name.clone(),
                reason: e.to_string(),
            })?;
        self.machine().transition(&op_name, Phase::Executing)?;

        let mut state = WorkerState::load(&self.ctx.workers_dir, self.kind)?;
        state.current_operation = Some(op_name.clone());
        state.save(&self.ctx.workers_dir)?;

        Ok(ActiveItem {
            op_name,
            session: session_name,
            workspace,
            branch,
            issue: item.id,
        })
    }

    /// Wait for the agent session to disappear.
    async fn supervise(&self, session_name: &str) -> Result<(), WorkerError> {
        loop {
            if !self.session.exists(session_name).await? {
                return Ok(());
            }
            tokio::time::sleep(self.supervise_interval).await;
        }
    }

    /// Classify a finished session and act on it.
    async fn conclude(&self, active: ActiveItem) -> Result<PollOutcome, WorkerError> {
        let mut state = WorkerState::load(&self.ctx.workers_dir, self.kind)?;
        state.current_operation = None;

        let sentinel = active.workspace.join(SENTINEL_FILE);
        if !sentinel.exists() {
            state.consecutive_failures += 1;
            state.last_crash_at = Some(chrono::Utc::now());
            state.save(&self.ctx.workers_dir)?;
            let failures = state.consecutive_failures;

            // The alert: first crash is loud, second is fatal.
            error!(
                kind = %self.kind,
                operation = %active.op_name,
                failures,
                "agent session ended without completion sentinel"
            );
            self.audit.append(
                &active.op_name,
                AuditEventKind::WorkerCrash { failures },
                None,
            )?;
            self.machine().transition(&active.op_name, Phase::Interrupted)?;
            let _ = self
                .tracker
                .add_note(active.issue, "Agent session crashed; item left claimed for inspection.")
                .await;

            if failures >= MAX_CONSECUTIVE_FAILURES {
                return Err(WorkerError::SelfStop {
                    kind: self.kind.to_string(),
                    failures,
                });
            }
            return Ok(PollOutcome::Crashed(failures));
        }

        std::fs::remove_file(&sentinel).map_err(|e| WorkerError::Other(e.into()))?;
        state.consecutive_failures = 0;
        state.save(&self.ctx.workers_dir)?;

        if !self.workspace.has_commits_ahead(&active.branch)? {
            // Clean exit with nothing produced: the agent is telling us it
            // cannot safely do this one.
            info!(operation = %active.op_name, "no commits produced, handing off");
            self.tracker
                .reassign(active.issue, &self.ctx.human_owner)
                .await?;
            self.tracker
                .add_note(
                    active.issue,
                    "Agent completed without producing changes; needs a human.",
                )
                .await?;
            self.machine().transition(&active.op_name, Phase::Interrupted)?;
            self.audit
                .append(&active.op_name, AuditEventKind::Handoff, None)?;
            return Ok(PollOutcome::Handoff(active.op_name));
        }

        if self.workspace.has_remote() {
            self.workspace
                .push_branch(&active.workspace, &active.branch)
                .await?;
        }
        self.machine().transition(&active.op_name, Phase::Completed)?;
        self.machine().transition(&active.op_name, Phase::PendingMerge)?;
        self.tracker
            .add_note(active.issue, "Work pushed; queued for merge.")
            .await?;
        self.tracker.close(active.issue).await?;

        let priority = self.kind.priority();
        let entry = QueueEntry::new(
            &active.op_name,
            active.workspace.clone(),
            priority,
            MergeKind::Operation,
        )
        .with_issue(active.issue);
        self.queue.enqueue(entry)?;
        self.audit
            .append(&active.op_name, AuditEventKind::Enqueued { priority }, None)?;
        Ok(PollOutcome::Enqueued(active.op_name))
    }
}

fn prompt_for(item: &WorkItem) -> String {
    if item.body.trim().is_empty() {
        item.title.clone()
    } else {
        format!("{}\n\n{}", item.title, item.body)
    }
}

/// Single-quote a string for the shell the session host hands the command
/// to.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
