//! Durable, lock-protected merge queue.
//!
//! All integrations onto the shared branch are serialized through one
//! versioned queue file. Entries are appended under the queue lock, ordered
//! by priority (lower = more urgent) with FIFO tie-break, and survive
//! process restarts. The daemon loop, readiness evaluation, and the
//! integration protocol live in [`daemon`].

pub mod daemon;

use crate::errors::QueueError;
use crate::lock::{LockManager, QUEUE_LOCK};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Schema version of the queue file.
pub const QUEUE_VERSION: u32 = 1;

/// A conflicted entry is retried automatically this many times; the next
/// conflict is terminal and requires manual resolution.
pub const MAX_CONFLICT_RETRIES: u32 = 1;

/// How many cycles the open-issues readiness check may fail before the
/// entry is parked as stuck.
pub const MAX_OPEN_ISSUE_CHECKS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Conflict,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Conflict => "conflict",
        };
        write!(f, "{s}")
    }
}

/// Whether an entry integrates a tracked operation or a bare branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    Operation,
    Branch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Operation name for [`MergeKind::Operation`], branch name for
    /// [`MergeKind::Branch`].
    pub operation: String,
    pub workspace: PathBuf,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub status: EntryStatus,
    pub merge_kind: MergeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Conflict retry counter.
    #[serde(default)]
    pub attempts: u32,
    /// Consecutive cycles the open-issues readiness check has failed.
    #[serde(default)]
    pub open_issue_checks: u32,
    /// Parked pending manual intervention; never auto-selected.
    #[serde(default)]
    pub stuck: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl QueueEntry {
    pub fn new(operation: &str, workspace: PathBuf, priority: i64, merge_kind: MergeKind) -> Self {
        Self {
            operation: operation.to_string(),
            workspace,
            priority,
            enqueued_at: Utc::now(),
            status: EntryStatus::Pending,
            merge_kind,
            issue_id: None,
            updated_at: None,
            attempts: 0,
            open_issue_checks: 0,
            stuck: false,
            reason: None,
        }
    }

    pub fn with_issue(mut self, issue_id: u64) -> Self {
        self.issue_id = Some(issue_id);
        self
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Whether this entry has reached its final state. A conflicted entry
    /// settles only once its automatic retry is spent.
    pub fn is_settled(&self) -> bool {
        match self.status {
            EntryStatus::Completed | EntryStatus::Failed => true,
            EntryStatus::Conflict => self.attempts > MAX_CONFLICT_RETRIES,
            _ => false,
        }
    }

    /// Whether the daemon may still select this entry: pending, or
    /// conflicted with an automatic retry remaining.
    pub fn selectable(&self) -> bool {
        if self.stuck {
            return false;
        }
        match self.status {
            EntryStatus::Pending => true,
            EntryStatus::Conflict => self.attempts <= MAX_CONFLICT_RETRIES,
            _ => false,
        }
    }

    fn age_reference(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.enqueued_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueFile {
    pub version: u32,
    pub entries: Vec<QueueEntry>,
}

impl Default for QueueFile {
    fn default() -> Self {
        Self {
            version: QUEUE_VERSION,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflict: usize,
}

pub struct MergeQueue {
    path: PathBuf,
    locks: LockManager,
}

impl MergeQueue {
    pub fn new(path: PathBuf, locks: LockManager) -> Self {
        Self { path, locks }
    }

    /// Read the queue file; a missing file is an empty queue.
    pub fn load(&self) -> Result<QueueFile> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let qf: QueueFile = serde_json::from_str(&content)
                    .with_context(|| format!("Corrupt queue file at {}", self.path.display()))?;
                anyhow::ensure!(
                    qf.version == QUEUE_VERSION,
                    "Unsupported queue file version {}",
                    qf.version
                );
                Ok(qf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueFile::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    fn save(&self, qf: &QueueFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create queue directory")?;
        }
        let tmp = self.path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
        let content =
            serde_json::to_string_pretty(qf).context("Failed to serialize queue file")?;
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).context("Failed to move queue file into place")?;
        Ok(())
    }

    /// Append a pending entry. Idempotent: a second enqueue for an
    /// operation with a live (non-terminal) entry is rejected. Holds the
    /// queue lock only for the append.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<QueueEntry, QueueError> {
        let _guard = self.locks.try_acquire(QUEUE_LOCK)?;
        let mut qf = self.load()?;
        let duplicate = qf
            .entries
            .iter()
            .any(|e| e.operation == entry.operation && !e.is_settled());
        if duplicate {
            return Err(QueueError::DuplicateEntry {
                operation: entry.operation,
            });
        }
        qf.entries.push(entry.clone());
        self.save(&qf)?;
        Ok(entry)
    }

    /// Mutate one entry under the queue lock.
    pub fn update<F>(&self, operation: &str, mutate: F) -> Result<QueueEntry, QueueError>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let _guard = self.locks.try_acquire(QUEUE_LOCK)?;
        let mut qf = self.load()?;
        let entry = qf
            .entries
            .iter_mut()
            .find(|e| e.operation == operation && !e.is_settled());
        let Some(entry) = entry else {
            return Err(QueueError::EntryNotFound {
                operation: operation.to_string(),
            });
        };
        mutate(entry);
        entry.touch();
        let updated = entry.clone();
        self.save(&qf)?;
        Ok(updated)
    }

    /// Like [`MergeQueue::update`] but also reaches terminal entries, for
    /// bookkeeping that runs after completion.
    pub fn update_any<F>(&self, operation: &str, mutate: F) -> Result<QueueEntry, QueueError>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let _guard = self.locks.try_acquire(QUEUE_LOCK)?;
        let mut qf = self.load()?;
        let Some(entry) = qf.entries.iter_mut().rev().find(|e| e.operation == operation) else {
            return Err(QueueError::EntryNotFound {
                operation: operation.to_string(),
            });
        };
        mutate(entry);
        let updated = entry.clone();
        self.save(&qf)?;
        Ok(updated)
    }

    /// Remove entries matching a predicate, under the queue lock. Returns
    /// the removed entries.
    pub fn remove_where<F>(&self, predicate: F) -> Result<Vec<QueueEntry>, QueueError>
    where
        F: Fn(&QueueEntry) -> bool,
    {
        let _guard = self.locks.try_acquire(QUEUE_LOCK)?;
        let mut qf = self.load()?;
        let (removed, kept): (Vec<_>, Vec<_>) =
            qf.entries.into_iter().partition(|e| predicate(e));
        qf.entries = kept;
        self.save(&qf)?;
        Ok(removed)
    }

    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.load()?.entries)
    }

    /// Settled entries older than `retention` are removable. Pending and
    /// processing entries are never pruned by age.
    pub fn prune_aged(&self, retention: chrono::Duration) -> Result<Vec<QueueEntry>, QueueError> {
        let cutoff = Utc::now() - retention;
        self.remove_where(|e| e.is_settled() && e.age_reference() < cutoff)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let entries = self.entries()?;
        let mut stats = QueueStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Processing => stats.processing += 1,
                EntryStatus::Completed => stats.completed += 1,
                EntryStatus::Failed => stats.failed += 1,
                EntryStatus::Conflict => stats.conflict += 1,
            }
        }
        Ok(stats)
    }
}

/// Selectable entries in dequeue order: lowest priority value first,
/// earliest enqueue within a priority band.
pub fn dequeue_order(entries: &[QueueEntry]) -> Vec<&QueueEntry> {
    let mut eligible: Vec<&QueueEntry> = entries.iter().filter(|e| e.selectable()).collect();
    eligible.sort_by_key(|e| (e.priority, e.enqueued_at));
    eligible
}
