//! Session host contract.
//!
//! The daemon launches each agent inside a named, inspectable session and
//! detects "agent finished" by the session disappearing. [`TmuxHost`] backs
//! this with tmux; tests use [`MemHost`].

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Launch a detached named session running `command` in `cwd`.
    async fn launch(&self, name: &str, cwd: &std::path::Path, command: &str) -> Result<()>;

    /// Whether the named session still exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Tear down a session (cancellation path).
    async fn kill(&self, name: &str) -> Result<()>;
}

/// Session host backed by tmux.
pub struct TmuxHost {
    tmux_cmd: String,
}

impl TmuxHost {
    pub fn new(tmux_cmd: &str) -> Self {
        Self {
            tmux_cmd: tmux_cmd.to_string(),
        }
    }
}

#[async_trait]
impl SessionHost for TmuxHost {
    async fn launch(&self, name: &str, cwd: &std::path::Path, command: &str) -> Result<()> {
        let output = Command::new(&self.tmux_cmd)
            .args(["new-session", "-d", "-s", name, "-c"])
            .arg(cwd)
            .arg(command)
            .output()
            .await
            .context("Failed to run tmux new-session")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux session launch failed: {}", stderr.trim());
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let output = Command::new(&self.tmux_cmd)
            .args(["has-session", "-t", name])
            .output()
            .await
            .context("Failed to run tmux has-session")?;
        // has-session exits non-zero both for "no such session" and for
        // "no server running"; either way the session is gone.
        Ok(output.status.success())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let output = Command::new(&self.tmux_cmd)
            .args(["kill-session", "-t", name])
            .output()
            .await
            .context("Failed to run tmux kill-session")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux kill-session failed: {}", stderr.trim());
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mem::MemHost;
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_mem_host_lifecycle() {
        let host = MemHost::new();
        assert!(!host.exists("convoy-fix-1").await.unwrap());
        host.launch("convoy-fix-1", Path::new("/tmp"), "claude -p hi")
            .await
            .unwrap();
        assert!(host.exists("convoy-fix-1").await.unwrap());
        host.end_session("convoy-fix-1");
        assert!(!host.exists("convoy-fix-1").await.unwrap());
        assert_eq!(host.launched().len(), 1);
    }
}
