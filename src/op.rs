//! Operation records and the lifecycle state machine.
//!
//! An operation is the unit of trackable work: a feature build, a bug fix,
//! a chore, a plan. Its phase moves along
//! `init → planned → queued → executing → {completed|failed|conflict|interrupted}
//! → pending_merge → merged`, with `held` and `cancelled` as side branches.
//! `blocked` is not a stored phase — it is derived from an unmerged `after`
//! dependency.
//!
//! Mutation goes exclusively through [`StateMachine`]; records are never
//! field-edited by multiple writers. The one sanctioned exception is the
//! merge daemon writing the merge fields while holding the merge lock, which
//! it does through the same idempotent `transition`.

use crate::audit::{AuditEventKind, AuditLog};
use crate::errors::StateError;
use crate::store::OperationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Plan,
    Feature,
    Fix,
    Chore,
    Roadmap,
    Goal,
}

impl OpKind {
    /// Whether the remote branch is deleted after a successful merge.
    /// Feature and plan branches are retained for archaeology.
    pub fn delete_branch_on_merge(&self) -> bool {
        matches!(self, OpKind::Fix | OpKind::Chore)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpKind::Plan => "plan",
            OpKind::Feature => "feature",
            OpKind::Fix => "fix",
            OpKind::Chore => "chore",
            OpKind::Roadmap => "roadmap",
            OpKind::Goal => "goal",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OpKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(OpKind::Plan),
            "feature" => Ok(OpKind::Feature),
            "fix" => Ok(OpKind::Fix),
            "chore" => Ok(OpKind::Chore),
            "roadmap" => Ok(OpKind::Roadmap),
            "goal" => Ok(OpKind::Goal),
            other => anyhow::bail!("Unknown operation kind: {other}"),
        }
    }
}

/// Lifecycle phase of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Planned,
    Queued,
    Executing,
    Completed,
    Failed,
    Conflict,
    Interrupted,
    PendingMerge,
    Merged,
    Cancelled,
}

impl Phase {
    /// Position along the main lifecycle line. Execution outcomes share a
    /// rank: completed/failed/conflict/interrupted are siblings, not ordered
    /// against each other.
    fn rank(&self) -> u8 {
        match self {
            Phase::Init => 0,
            Phase::Planned => 1,
            Phase::Queued => 2,
            Phase::Executing => 3,
            Phase::Completed | Phase::Failed | Phase::Conflict | Phase::Interrupted => 4,
            Phase::PendingMerge => 5,
            Phase::Merged => 6,
            Phase::Cancelled => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Merged | Phase::Cancelled)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Planned => "planned",
            Phase::Queued => "queued",
            Phase::Executing => "executing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Conflict => "conflict",
            Phase::Interrupted => "interrupted",
            Phase::PendingMerge => "pending_merge",
            Phase::Merged => "merged",
            Phase::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Phase::Init),
            "planned" => Ok(Phase::Planned),
            "queued" => Ok(Phase::Queued),
            "executing" => Ok(Phase::Executing),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            "conflict" => Ok(Phase::Conflict),
            "interrupted" => Ok(Phase::Interrupted),
            "pending_merge" => Ok(Phase::PendingMerge),
            "merged" => Ok(Phase::Merged),
            "cancelled" => Ok(Phase::Cancelled),
            other => anyhow::bail!("Unknown phase: {other}"),
        }
    }
}

/// Schema version for operation records on disk.
pub const OPERATION_VERSION: u32 = 1;

fn operation_version() -> u32 {
    OPERATION_VERSION
}

/// Durable record for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default = "operation_version")]
    pub version: u32,
    pub name: String,
    pub kind: OpKind,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    /// Phase to return to when a hold is released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Name of an operation that must reach `merged` before this one may
    /// resume. Forms a chain; cycles are rejected at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default)]
    pub held: bool,
    /// Merge-eligibility flag checked by queue readiness.
    #[serde(default)]
    pub merge_ok: bool,
    /// Session-host handle of the supervising agent session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Last recorded failure text, surfaced by the status layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Operation {
    pub fn new(name: &str, kind: OpKind) -> Self {
        Self {
            version: OPERATION_VERSION,
            name: name.to_string(),
            kind,
            phase: Phase::Init,
            created_at: Utc::now(),
            prior_phase: None,
            held_at: None,
            completed_at: None,
            merged_at: None,
            host: None,
            worktree: None,
            branch: None,
            after: None,
            held: false,
            merge_ok: false,
            session: None,
            issue_id: None,
            prompt: None,
            labels: Vec::new(),
            reason: None,
        }
    }

    pub fn with_after(mut self, after: &str) -> Self {
        self.after = Some(after.to_string());
        self
    }
}

/// Lifecycle transitions over the operation store.
pub struct StateMachine<'a> {
    store: &'a OperationStore,
    audit: &'a AuditLog,
}

impl<'a> StateMachine<'a> {
    pub fn new(store: &'a OperationStore, audit: &'a AuditLog) -> Self {
        Self { store, audit }
    }

    /// Register a new operation. Rejects duplicate names, dangling `after`
    /// references, and cycles through the `after` chain.
    pub fn create(&self, op: Operation) -> Result<Operation, StateError> {
        if self.store.load(&op.name).map_err(StateError::Other)?.is_some() {
            return Err(StateError::DuplicateOperation {
                name: op.name.clone(),
            });
        }
        if let Some(after) = &op.after {
            if after == &op.name {
                return Err(StateError::DependencyCycle {
                    name: op.name.clone(),
                    via: after.clone(),
                });
            }
            let Some(dep) = self.store.load(after).map_err(StateError::Other)? else {
                return Err(StateError::UnknownDependency {
                    name: op.name.clone(),
                    after: after.clone(),
                });
            };
            self.check_cycle(&op.name, &dep)?;
        }
        self.store.save(&op).map_err(StateError::Other)?;
        self.audit
            .append(&op.name, AuditEventKind::Created, Some(op.kind.to_string()))
            .map_err(StateError::Other)?;
        Ok(op)
    }

    fn check_cycle(&self, name: &str, start: &Operation) -> Result<(), StateError> {
        let mut current = start.after.clone();
        let mut depth = 0usize;
        while let Some(next) = current {
            if next == name {
                return Err(StateError::DependencyCycle {
                    name: name.to_string(),
                    via: start.name.clone(),
                });
            }
            depth += 1;
            if depth > 64 {
                return Err(StateError::DependencyCycle {
                    name: name.to_string(),
                    via: next,
                });
            }
            current = self
                .store
                .load(&next)
                .map_err(StateError::Other)?
                .and_then(|op| op.after);
        }
        Ok(())
    }

    /// Apply a phase transition. Idempotent: a repeated target, or a target
    /// at or behind the current phase, succeeds silently — multiple
    /// collaborators may race to apply the same completion signal. Only
    /// backward movement out of a terminal phase is rejected.
    pub fn transition(&self, name: &str, target: Phase) -> Result<Operation, StateError> {
        let mut op = self
            .store
            .load(name)
            .map_err(StateError::Other)?
            .ok_or_else(|| StateError::UnknownOperation { name: name.into() })?;

        let current = if op.held {
            op.prior_phase.unwrap_or(op.phase)
        } else {
            op.phase
        };

        if current == target {
            return Ok(op);
        }
        if current.is_terminal() {
            return Err(StateError::TerminalPhase {
                name: name.into(),
                phase: current.to_string(),
                target: target.to_string(),
            });
        }
        if target != Phase::Cancelled && target.rank() <= current.rank() {
            // Late or duplicate signal from a slower collaborator.
            return Ok(op);
        }

        let from = current;
        match target {
            Phase::Completed | Phase::Failed | Phase::Conflict | Phase::Interrupted => {
                op.completed_at = Some(Utc::now());
            }
            Phase::PendingMerge => {
                op.merge_ok = true;
            }
            Phase::Merged => {
                op.merged_at = Some(Utc::now());
            }
            Phase::Cancelled => {
                op.held = false;
                op.prior_phase = None;
            }
            _ => {}
        }

        if op.held && target != Phase::Cancelled {
            // Completion signals land while held; the hold itself survives.
            op.prior_phase = Some(target);
        } else {
            op.phase = target;
        }
        self.store.save(&op).map_err(StateError::Other)?;
        self.audit
            .append(
                name,
                AuditEventKind::Transition {
                    from: from.to_string(),
                    to: target.to_string(),
                },
                None,
            )
            .map_err(StateError::Other)?;
        Ok(op)
    }

    /// Place an operation on hold. No-op when already held.
    pub fn hold(&self, name: &str) -> Result<Operation, StateError> {
        let mut op = self
            .store
            .load(name)
            .map_err(StateError::Other)?
            .ok_or_else(|| StateError::UnknownOperation { name: name.into() })?;
        if op.held {
            return Ok(op);
        }
        if op.phase.is_terminal() {
            return Err(StateError::TerminalPhase {
                name: name.into(),
                phase: op.phase.to_string(),
                target: "held".into(),
            });
        }
        op.held = true;
        op.held_at = Some(Utc::now());
        op.prior_phase = Some(op.phase);
        self.store.save(&op).map_err(StateError::Other)?;
        self.audit
            .append(name, AuditEventKind::Held, None)
            .map_err(StateError::Other)?;
        Ok(op)
    }

    /// Release a hold. Without `force`, refuses while the `after`
    /// dependency has not merged. A dependency record that no longer exists
    /// counts as satisfied: merged operations may have been pruned.
    pub fn resume(&self, name: &str, force: bool) -> Result<Operation, StateError> {
        let mut op = self
            .store
            .load(name)
            .map_err(StateError::Other)?
            .ok_or_else(|| StateError::UnknownOperation { name: name.into() })?;
        if !op.held {
            return Ok(op);
        }
        if !force
            && let Some(after) = &op.after
            && let Some(dep) = self.store.load(after).map_err(StateError::Other)?
            && dep.phase != Phase::Merged
        {
            return Err(StateError::DependencyUnmerged {
                name: name.into(),
                after: after.clone(),
            });
        }
        op.held = false;
        op.held_at = None;
        if let Some(prior) = op.prior_phase.take() {
            op.phase = prior;
        }
        self.store.save(&op).map_err(StateError::Other)?;
        self.audit
            .append(name, AuditEventKind::Resumed, None)
            .map_err(StateError::Other)?;
        Ok(op)
    }

    /// Cancel an operation from any non-terminal phase.
    pub fn cancel(&self, name: &str) -> Result<Operation, StateError> {
        let op = self.transition(name, Phase::Cancelled)?;
        self.audit
            .append(name, AuditEventKind::Cancelled, None)
            .map_err(StateError::Other)?;
        Ok(op)
    }

    /// Derived `blocked` condition: a non-executing operation whose `after`
    /// reference has not reached `merged`.
    pub fn is_blocked(&self, op: &Operation) -> Result<bool, StateError> {
        if op.phase == Phase::Executing {
            return Ok(false);
        }
        let Some(after) = &op.after else {
            return Ok(false);
        };
        match self.store.load(after).map_err(StateError::Other)? {
            Some(dep) => Ok(dep.phase != Phase::Merged),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixtures(dir: &std::path::Path) -> (OperationStore, AuditLog) {
        (
            OperationStore::new(dir.join("store")),
            AuditLog::new(dir.join("audit")),
        )
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        let op = store.load("auth").unwrap().unwrap();
        assert_eq!(op.phase, Phase::Init);
        assert_eq!(op.kind, OpKind::Feature);
    }

    #[test]
    fn test_create_rejects_duplicate_name() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        let err = machine
            .create(Operation::new("auth", OpKind::Fix))
            .unwrap_err();
        assert!(matches!(err, StateError::DuplicateOperation { .. }));
    }

    #[test]
    fn test_create_rejects_dangling_after() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        let err = machine
            .create(Operation::new("b", OpKind::Feature).with_after("ghost"))
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownDependency { .. }));
    }

    #[test]
    fn test_create_rejects_after_cycle() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("a", OpKind::Feature)).unwrap();
        machine
            .create(Operation::new("b", OpKind::Feature).with_after("a"))
            .unwrap();
        // Close the loop a → b by editing a's record the way no collaborator
        // should; create("c", after=b) then must still walk cleanly, while
        // a direct cycle is refused.
        let err = machine
            .create(Operation::new("a2", OpKind::Feature).with_after("a2"))
            .unwrap_err();
        assert!(matches!(err, StateError::DependencyCycle { .. }));
        machine
            .create(Operation::new("c", OpKind::Feature).with_after("b"))
            .unwrap();
    }

    #[test]
    fn test_transition_is_idempotent() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::Executing).unwrap();
        let once = machine.transition("auth", Phase::Completed).unwrap();
        let twice = machine.transition("auth", Phase::Completed).unwrap();
        assert_eq!(once.phase, twice.phase);
        assert_eq!(store.load("auth").unwrap().unwrap().phase, Phase::Completed);
    }

    #[test]
    fn test_late_signal_from_earlier_phase_is_silent() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::PendingMerge).unwrap();
        // A slow worker still reporting execution does not move us back.
        let op = machine.transition("auth", Phase::Executing).unwrap();
        assert_eq!(op.phase, Phase::PendingMerge);
    }

    #[test]
    fn test_terminal_phase_rejects_backward_transition() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::Merged).unwrap();
        let err = machine.transition("auth", Phase::Executing).unwrap_err();
        assert!(matches!(err, StateError::TerminalPhase { .. }));
        // Repeating the terminal target stays silent.
        machine.transition("auth", Phase::Merged).unwrap();
    }

    #[test]
    fn test_merged_sets_timestamp_and_pending_merge_sets_flag() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        let op = machine.transition("auth", Phase::PendingMerge).unwrap();
        assert!(op.merge_ok);
        let op = machine.transition("auth", Phase::Merged).unwrap();
        assert!(op.merged_at.is_some());
    }

    #[test]
    fn test_hold_is_noop_when_already_held() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::Queued).unwrap();
        let first = machine.hold("auth").unwrap();
        let second = machine.hold("auth").unwrap();
        assert_eq!(first.held_at, second.held_at);
        assert_eq!(second.prior_phase, Some(Phase::Queued));
    }

    #[test]
    fn test_resume_restores_prior_phase() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::Executing).unwrap();
        machine.hold("auth").unwrap();
        let op = machine.resume("auth", false).unwrap();
        assert!(!op.held);
        assert_eq!(op.phase, Phase::Executing);
    }

    #[test]
    fn test_resume_blocked_by_unmerged_dependency() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("a", OpKind::Feature)).unwrap();
        machine
            .create(Operation::new("b", OpKind::Feature).with_after("a"))
            .unwrap();
        machine.hold("b").unwrap();

        let err = machine.resume("b", false).unwrap_err();
        assert!(matches!(err, StateError::DependencyUnmerged { .. }));

        // Force overrides the gate.
        machine.hold("b").unwrap();
        machine.resume("b", true).unwrap();

        // Once A merges, B resumes normally.
        machine.hold("b").unwrap();
        machine.transition("a", Phase::Merged).unwrap();
        let op = machine.resume("b", false).unwrap();
        assert!(!op.held);
    }

    #[test]
    fn test_completion_signal_while_held_updates_prior_phase() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::Executing).unwrap();
        machine.hold("auth").unwrap();
        machine.transition("auth", Phase::Completed).unwrap();
        let op = store.load("auth").unwrap().unwrap();
        assert!(op.held);
        assert_eq!(op.prior_phase, Some(Phase::Completed));
        let op = machine.resume("auth", true).unwrap();
        assert_eq!(op.phase, Phase::Completed);
    }

    #[test]
    fn test_cancel_from_any_non_terminal_phase() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("auth", OpKind::Feature)).unwrap();
        machine.transition("auth", Phase::Executing).unwrap();
        let op = machine.cancel("auth").unwrap();
        assert_eq!(op.phase, Phase::Cancelled);
        // Cancel is terminal: nothing moves after it.
        let err = machine.transition("auth", Phase::Completed).unwrap_err();
        assert!(matches!(err, StateError::TerminalPhase { .. }));
    }

    #[test]
    fn test_blocked_is_derived_from_after() {
        let dir = tempdir().unwrap();
        let (store, audit) = fixtures(dir.path());
        let machine = StateMachine::new(&store, &audit);
        machine.create(Operation::new("a", OpKind::Feature)).unwrap();
        let b = machine
            .create(Operation::new("b", OpKind::Feature).with_after("a"))
            .unwrap();
        assert!(machine.is_blocked(&b).unwrap());
        machine.transition("a", Phase::Merged).unwrap();
        assert!(!machine.is_blocked(&b).unwrap());
    }

    #[test]
    fn test_kind_branch_retention_policy() {
        assert!(OpKind::Fix.delete_branch_on_merge());
        assert!(OpKind::Chore.delete_branch_on_merge());
        assert!(!OpKind::Feature.delete_branch_on_merge());
        assert!(!OpKind::Plan.delete_branch_on_merge());
    }

    #[test]
    fn test_phase_display_roundtrip() {
        for phase in [
            Phase::Init,
            Phase::PendingMerge,
            Phase::Merged,
            Phase::Cancelled,
        ] {
            let parsed: Phase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
    }
}
