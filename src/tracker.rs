//! Issue tracker contract.
//!
//! The core consumes exactly four capabilities from the tracker: list items
//! by label, claim/reassign an item's owner, close an item, attach a note.
//! [`GhTracker`] backs this with the `gh` CLI; tests use [`MemTracker`].

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

/// A unit of ready work from the tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkItem {
    #[serde(rename = "number")]
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Open, unassigned items carrying the given label.
    async fn list_ready(&self, label: &str) -> Result<Vec<WorkItem>>;

    /// Atomically claim an item for `owner`. Returns false if another
    /// worker got there first.
    async fn claim(&self, id: u64, owner: &str) -> Result<bool>;

    async fn is_closed(&self, id: u64) -> Result<bool>;

    async fn close(&self, id: u64) -> Result<()>;

    /// Hand the item to a different owner (human handoff path).
    async fn reassign(&self, id: u64, owner: &str) -> Result<()>;

    async fn add_note(&self, id: u64, note: &str) -> Result<()>;

    /// Most recent comment on the item, if any.
    async fn latest_note(&self, id: u64) -> Result<Option<String>>;
}

/// Tracker backed by the GitHub CLI.
pub struct GhTracker {
    gh_cmd: String,
}

impl GhTracker {
    pub fn new(gh_cmd: &str) -> Self {
        Self {
            gh_cmd: gh_cmd.to_string(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(&self.gh_cmd)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", self.gh_cmd, args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} {} failed: {}", self.gh_cmd, args.join(" "), stderr.trim());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl IssueTracker for GhTracker {
    async fn list_ready(&self, label: &str) -> Result<Vec<WorkItem>> {
        let stdout = self
            .gh(&[
                "issue",
                "list",
                "--label",
                label,
                "--state",
                "open",
                "--search",
                "no:assignee",
                "--json",
                "number,title,body",
            ])
            .await?;
        serde_json::from_slice(&stdout).context("Failed to parse gh issue list output")
    }

    async fn claim(&self, id: u64, owner: &str) -> Result<bool> {
        // gh rejects the edit if the issue is already assigned only when we
        // re-check; assignment itself is last-writer-wins, so verify after.
        self.gh(&[
            "issue",
            "edit",
            &id.to_string(),
            "--add-assignee",
            owner,
        ])
        .await?;
        let stdout = self
            .gh(&[
                "issue",
                "view",
                &id.to_string(),
                "--json",
                "assignees",
                "--jq",
                ".assignees | length",
            ])
            .await?;
        let count: usize = String::from_utf8_lossy(&stdout).trim().parse().unwrap_or(0);
        Ok(count == 1)
    }

    async fn is_closed(&self, id: u64) -> Result<bool> {
        let stdout = self
            .gh(&[
                "issue",
                "view",
                &id.to_string(),
                "--json",
                "state",
                "--jq",
                ".state",
            ])
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim() == "CLOSED")
    }

    async fn close(&self, id: u64) -> Result<()> {
        self.gh(&["issue", "close", &id.to_string()]).await?;
        Ok(())
    }

    async fn reassign(&self, id: u64, owner: &str) -> Result<()> {
        let id = id.to_string();
        self.gh(&["issue", "edit", &id, "--remove-assignee", "@me"])
            .await?;
        self.gh(&["issue", "edit", &id, "--add-assignee", owner])
            .await?;
        Ok(())
    }

    async fn add_note(&self, id: u64, note: &str) -> Result<()> {
        self.gh(&["issue", "comment", &id.to_string(), "--body", note])
            .await?;
        Ok(())
    }

    async fn latest_note(&self, id: u64) -> Result<Option<String>> {
        let stdout = self
            .gh(&[
                "issue",
                "view",
                &id.to_string(),
                "--json",
                "comments",
                "--jq",
                ".comments | last | .body",
            ])
            .await?;
        let body = String::from_utf8_lossy(&stdout).trim().to_string();
        if body.is_empty() || body == "null" {
            Ok(None)
        } else {
            Ok(Some(body))
        }
    }
}

/// In-memory tracker for daemon tests.
#[cfg(test)]
pub mod mem {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct MemItem {
        pub item: WorkItem,
        pub labels: Vec<String>,
        pub assignee: Option<String>,
        pub closed: bool,
        pub notes: Vec<String>,
    }

    #[derive(Default)]
    pub struct MemTracker {
        items: Mutex<HashMap<u64, MemItem>>,
    }

    impl MemTracker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_item(&self, id: u64, title: &str, labels: &[&str]) {
            self.items.lock().unwrap().insert(
                id,
                MemItem {
                    item: WorkItem {
                        id,
                        title: title.to_string(),
                        body: String::new(),
                    },
                    labels: labels.iter().map(|s| s.to_string()).collect(),
                    assignee: None,
                    closed: false,
                    notes: Vec::new(),
                },
            );
        }

        pub fn assignee(&self, id: u64) -> Option<String> {
            self.items
                .lock()
                .unwrap()
                .get(&id)
                .and_then(|i| i.assignee.clone())
        }

        pub fn notes(&self, id: u64) -> Vec<String> {
            self.items
                .lock()
                .unwrap()
                .get(&id)
                .map(|i| i.notes.clone())
                .unwrap_or_default()
        }

        pub fn set_closed(&self, id: u64, closed: bool) {
            if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
                item.closed = closed;
            }
        }
    }

    #[async_trait]
    impl IssueTracker for MemTracker {
        async fn list_ready(&self, label: &str) -> Result<Vec<WorkItem>> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .values()
                .filter(|i| {
                    !i.closed && i.assignee.is_none() && i.labels.iter().any(|l| l == label)
                })
                .map(|i| i.item.clone())
                .collect())
        }

        async fn claim(&self, id: u64, owner: &str) -> Result<bool> {
            let mut items = self.items.lock().unwrap();
            let item = items.get_mut(&id).context("No such item")?;
            if item.assignee.is_some() {
                return Ok(false);
            }
            item.assignee = Some(owner.to_string());
            Ok(true)
        }

        async fn is_closed(&self, id: u64) -> Result<bool> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .get(&id)
                .map(|i| i.closed)
                .unwrap_or(false))
        }

        async fn close(&self, id: u64) -> Result<()> {
            self.set_closed(id, true);
            Ok(())
        }

        async fn reassign(&self, id: u64, owner: &str) -> Result<()> {
            let mut items = self.items.lock().unwrap();
            let item = items.get_mut(&id).context("No such item")?;
            item.assignee = Some(owner.to_string());
            Ok(())
        }

        async fn add_note(&self, id: u64, note: &str) -> Result<()> {
            let mut items = self.items.lock().unwrap();
            let item = items.get_mut(&id).context("No such item")?;
            item.notes.push(note.to_string());
            Ok(())
        }

        async fn latest_note(&self, id: u64) -> Result<Option<String>> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .get(&id)
                .and_then(|i| i.notes.last().cloned()))
        }
    }
}
