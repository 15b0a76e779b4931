//! Durable per-operation state store.
//!
//! One JSON record per operation under `.convoy/store/`, keyed by name.
//! Writes go through a temporary file and an atomic rename so readers never
//! observe a half-written record.

use crate::op::Operation;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct OperationStore {
    dir: PathBuf,
}

impl OperationStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Persist a record atomically (write to a temp file, rename into place).
    pub fn save(&self, op: &Operation) -> Result<()> {
        fs::create_dir_all(&self.dir).context("Failed to create store directory")?;
        let path = self.record_path(&op.name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", op.name, uuid::Uuid::new_v4()));
        let content =
            serde_json::to_string_pretty(op).context("Failed to serialize operation record")?;
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move record into place at {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<Operation>> {
        let path = self.record_path(name);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let op = serde_json::from_str(&content)
                    .with_context(|| format!("Corrupt operation record at {}", path.display()))?;
                Ok(Some(op))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// All records, sorted by creation time.
    pub fn list(&self) -> Result<Vec<Operation>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ops = Vec::new();
        for entry in fs::read_dir(&self.dir).context("Failed to read store directory")? {
            let entry = entry?;
            let path = entry.path();
            if !is_record(&path) {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let op: Operation = serde_json::from_str(&content)
                .with_context(|| format!("Corrupt operation record at {}", path.display()))?;
            ops.push(op);
        }
        ops.sort_by_key(|op| op.created_at);
        Ok(ops)
    }

    /// Load, apply a mutation, save. Single-writer-per-operation is a
    /// convention, not a lock: callers that are not the owning daemon must
    /// keep their writes idempotent.
    pub fn update<F>(&self, name: &str, mutate: F) -> Result<Option<Operation>>
    where
        F: FnOnce(&mut Operation),
    {
        let Some(mut op) = self.load(name)? else {
            return Ok(None);
        };
        mutate(&mut op);
        self.save(&op)?;
        Ok(Some(op))
    }

    /// Remove a record (pruning of long-terminal operations).
    pub fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to remove operation record"),
        }
    }
}

fn is_record(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'))
}
