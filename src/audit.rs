//! Append-only per-operation audit logs.
//!
//! Every lifecycle event (creation, phase transitions, enqueues, merges,
//! crashes, handoffs) is appended as one JSON line to
//! `.convoy/audit/<operation>.jsonl`. The log is never rewritten; it is the
//! record of what actually happened to an operation, independent of the
//! mutable state record.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub operation: String,
    #[serde(flatten)]
    pub kind: AuditEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventKind {
    Created,
    Transition { from: String, to: String },
    Held,
    Resumed,
    Cancelled,
    Enqueued { priority: i64 },
    MergeStarted,
    Merged,
    MergeConflict,
    MergeFailed,
    WorkerCrash { failures: u32 },
    Handoff,
    Pruned,
}

pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn log_path(&self, operation: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", operation))
    }

    pub fn append(
        &self,
        operation: &str,
        kind: AuditEventKind,
        detail: Option<String>,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("Failed to create audit directory")?;
        let event = AuditEvent {
            id: Uuid::new_v4(),
            at: Utc::now(),
            operation: operation.to_string(),
            kind,
            detail,
        };
        let line = serde_json::to_string(&event).context("Failed to serialize audit event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(operation))
            .context("Failed to open audit log")?;
        writeln!(file, "{}", line).context("Failed to append audit event")?;
        Ok(())
    }

    /// Full event history for one operation, oldest first. Unparseable
    /// lines (torn writes from a crash) are skipped rather than fatal.
    pub fn read(&self, operation: &str) -> Result<Vec<AuditEvent>> {
        let path = self.log_path(operation);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
