//! Read-only project status: operations with derived markers, queue
//! counts, and current lock holders. Pure reads, no locks taken.

use crate::audit::AuditLog;
use crate::config::ProjectContext;
use crate::lock::{LockManager, LockMarker, MERGE_LOCK, QUEUE_LOCK};
use crate::op::{OpKind, Phase, StateMachine};
use crate::queue::{MergeQueue, QueueStats};
use crate::store::OperationStore;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct OperationRow {
    pub name: String,
    pub kind: OpKind,
    pub phase: Phase,
    pub held: bool,
    /// Derived: waiting on an unmerged `after` dependency.
    pub blocked: bool,
    pub after: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct StatusSnapshot {
    pub operations: Vec<OperationRow>,
    pub queue: QueueStats,
    pub queue_lock: Option<LockMarker>,
    pub merge_lock: Option<LockMarker>,
}

pub fn snapshot(ctx: &ProjectContext) -> Result<StatusSnapshot> {
    let store = OperationStore::new(ctx.store_dir.clone());
    let audit = AuditLog::new(ctx.audit_dir.clone());
    let machine = StateMachine::new(&store, &audit);
    let locks = LockManager::new(ctx.locks_dir.clone(), "status");
    let queue = MergeQueue::new(
        ctx.queue_file.clone(),
        LockManager::new(ctx.locks_dir.clone(), "status"),
    );

    let mut operations = Vec::new();
    for op in store.list()? {
        let blocked = machine.is_blocked(&op)?;
        operations.push(OperationRow {
            name: op.name.clone(),
            kind: op.kind,
            phase: op.phase,
            held: op.held,
            blocked,
            after: op.after.clone(),
            reason: op.reason.clone(),
        });
    }

    Ok(StatusSnapshot {
        operations,
        queue: queue.stats()?,
        queue_lock: locks.inspect(QUEUE_LOCK)?,
        merge_lock: locks.inspect(MERGE_LOCK)?,
    })
}
