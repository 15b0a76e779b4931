//! Autonomous worker identities, persisted worker state, and the crash
//! backoff schedule. The polling loop lives in [`daemon`].

pub mod daemon;

use crate::op::OpKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File an agent writes into its workspace to signal a clean exit.
pub const SENTINEL_FILE: &str = ".convoy-done";

/// A worker stops itself after this many consecutive crashed sessions.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// The two autonomous worker flavors. Feature and plan work stays
/// human-initiated; only small, labeled items are picked up unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Fix,
    Chore,
}

impl WorkerKind {
    /// Tracker label this worker polls for.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Fix => "convoy:fix",
            WorkerKind::Chore => "convoy:chore",
        }
    }

    pub fn op_kind(&self) -> OpKind {
        match self {
            WorkerKind::Fix => OpKind::Fix,
            WorkerKind::Chore => OpKind::Chore,
        }
    }

    /// Queue priority for work this worker produces. Fixes jump ahead of
    /// routine chores.
    pub fn priority(&self) -> i64 {
        match self {
            WorkerKind::Fix => 0,
            WorkerKind::Chore => 10,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerKind::Fix => "fix",
            WorkerKind::Chore => "chore",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fix" => Ok(WorkerKind::Fix),
            "chore" => Ok(WorkerKind::Chore),
            other => anyhow::bail!("Unknown worker kind: {other}"),
        }
    }
}

/// Delay before the next poll after `failures` consecutive crashes:
/// 5s doubling per failure, capped at 5 minutes.
pub fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let secs = 5u64.saturating_mul(1u64 << (failures - 1).min(10));
    Duration::from_secs(secs.min(300))
}

/// Durable per-worker bookkeeping at `.convoy/workers/<kind>.json`.
/// Survives restarts so the crash counter cannot be reset by bouncing the
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub kind: WorkerKind,
    /// Pid of the daemon that last wrote this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_crash_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
}

impl WorkerState {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            pid: None,
            consecutive_failures: 0,
            last_poll_at: None,
            last_crash_at: None,
            current_operation: None,
        }
    }

    fn path(dir: &Path, kind: WorkerKind) -> std::path::PathBuf {
        dir.join(format!("{}.json", kind))
    }

    pub fn load(dir: &Path, kind: WorkerKind) -> Result<Self> {
        let path = Self::path(dir, kind);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt worker state at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(kind)),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).context("Failed to create workers directory")?;
        let path = Self::path(dir, self.kind);
        let tmp = dir.join(format!(".{}.{}.tmp", self.kind, uuid::Uuid::new_v4()));
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize worker state")?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).context("Failed to move worker state into place")?;
        Ok(())
    }
}
