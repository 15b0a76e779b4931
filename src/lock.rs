//! Advisory, file-based mutual exclusion with liveness-based staleness.
//!
//! Each lock is a marker file under the project's `locks/` directory holding
//! the owner's identity and process id. A marker whose recorded process is no
//! longer alive is stale and may be reclaimed by any future acquirer.
//!
//! Two named locks exist in this design: [`QUEUE_LOCK`] guards the merge
//! queue's entry list, [`MERGE_LOCK`] guards the checkout/merge/push step.
//! They are separate because queue bookkeeping and the merge itself have
//! different contention profiles and failure windows.

use crate::errors::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Name of the lock guarding queue-file bookkeeping.
pub const QUEUE_LOCK: &str = "merge-queue";
/// Name of the lock guarding the integration (checkout/merge/push) step.
pub const MERGE_LOCK: &str = "merge";

/// Platform-dependent "is this process still running" capability.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the host OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

#[cfg(target_os = "linux")]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        // /proc/{pid}/stat rather than /proc/{pid}: zombies keep the
        // directory but show as defunct in stat.
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(true)
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        // No reliable check: never auto-reclaim, operators delete manually.
        true
    }
}

/// Marker written into a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Manages named locks under one directory.
pub struct LockManager {
    locks_dir: PathBuf,
    holder: String,
    probe: Arc<dyn ProcessProbe>,
}

impl LockManager {
    pub fn new(locks_dir: PathBuf, holder: &str) -> Self {
        Self::with_probe(locks_dir, holder, Arc::new(SystemProbe))
    }

    pub fn with_probe(locks_dir: PathBuf, holder: &str, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            locks_dir,
            holder: holder.to_string(),
            probe,
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", name))
    }

    /// Non-blocking acquisition. Fails immediately with [`LockError::Held`]
    /// when a live process owns the lock; stale markers are reclaimed.
    pub fn try_acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        fs::create_dir_all(&self.locks_dir)?;
        self.try_acquire_inner(name, 0)
    }

    fn try_acquire_inner(&self, name: &str, attempt: u32) -> Result<LockGuard, LockError> {
        if attempt > 2 {
            return Err(LockError::Corrupt { name: name.into() });
        }

        let path = self.lock_path(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let marker = LockMarker {
                    holder: self.holder.clone(),
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                let line = serde_json::to_string(&marker)
                    .map_err(|e| LockError::Io(std::io::Error::other(e)))?;
                writeln!(file, "{}", line)?;
                file.flush()?;
                Ok(LockGuard { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.handle_existing(name, &path, attempt)
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn handle_existing(
        &self,
        name: &str,
        path: &Path,
        attempt: u32,
    ) -> Result<LockGuard, LockError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                if let Ok(marker) = serde_json::from_str::<LockMarker>(content.trim()) {
                    if self.probe.is_alive(marker.pid) {
                        return Err(LockError::Held {
                            name: name.into(),
                            pid: marker.pid,
                        });
                    }
                    warn!(
                        lock = name,
                        pid = marker.pid,
                        holder = %marker.holder,
                        "reclaiming stale lock from dead process"
                    );
                    if let Err(e) = fs::remove_file(path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(LockError::Io(e));
                        }
                    }
                    return self.try_acquire_inner(name, attempt + 1);
                }
                // Unparseable marker: likely a torn write from a crashed
                // holder. Clear it and retry.
                warn!(lock = name, "lock marker unreadable, clearing");
                let _ = fs::remove_file(path);
                self.try_acquire_inner(name, attempt + 1)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Released between our create attempt and the read.
                self.try_acquire_inner(name, attempt + 1)
            }
            Err(_) => Err(LockError::Corrupt { name: name.into() }),
        }
    }

    /// Polling acquisition for callers that explicitly want to wait.
    pub async fn acquire_wait(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.try_acquire(name) {
                Ok(guard) => return Ok(guard),
                Err(LockError::Held { .. }) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(LockError::Timeout { name: name.into() });
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the current marker for a lock, if any.
    pub fn inspect(&self, name: &str) -> Result<Option<LockMarker>, LockError> {
        let path = self.lock_path(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(content.trim()).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }
}

/// RAII guard for a named lock. Removes the marker file on drop, so the
/// lock releases on every exit path of the holding scope.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
