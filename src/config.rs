//! Project context and configuration for Convoy.
//!
//! All core functions take an explicit [`ProjectContext`] resolved once at
//! process start — there is no ambient "current project" state. Settings are
//! layered: `convoy.toml` in the project root, then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! integration_branch = "main"
//! remote = "origin"
//! human_owner = "ops-team"
//!
//! [daemon]
//! queue_poll_secs = 30
//! worker_poll_secs = 60
//! retention_hours = 4
//!
//! [commands]
//! agent_cmd = "claude"
//! tmux_cmd = "tmux"
//! gh_cmd = "gh"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of `convoy.toml`, all sections optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub commands: CommandsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Tracker owner that receives human-handoff reassignments.
    #[serde(default = "default_human_owner")]
    pub human_owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_queue_poll_secs")]
    pub queue_poll_secs: u64,
    #[serde(default = "default_worker_poll_secs")]
    pub worker_poll_secs: u64,
    /// Terminal queue entries older than this are pruned.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsSection {
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
    #[serde(default = "default_tmux_cmd")]
    pub tmux_cmd: String,
    #[serde(default = "default_gh_cmd")]
    pub gh_cmd: String,
}

fn default_integration_branch() -> String {
    "main".to_string()
}
fn default_remote() -> String {
    "origin".to_string()
}
fn default_human_owner() -> String {
    "human".to_string()
}
fn default_queue_poll_secs() -> u64 {
    30
}
fn default_worker_poll_secs() -> u64 {
    60
}
fn default_retention_hours() -> u64 {
    4
}
fn default_agent_cmd() -> String {
    std::env::var("CONVOY_AGENT_CMD").unwrap_or_else(|_| "claude".to_string())
}
fn default_tmux_cmd() -> String {
    "tmux".to_string()
}
fn default_gh_cmd() -> String {
    "gh".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            integration_branch: default_integration_branch(),
            remote: default_remote(),
            human_owner: default_human_owner(),
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            queue_poll_secs: default_queue_poll_secs(),
            worker_poll_secs: default_worker_poll_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            agent_cmd: default_agent_cmd(),
            tmux_cmd: default_tmux_cmd(),
            gh_cmd: default_gh_cmd(),
        }
    }
}

impl ConvoyToml {
    /// Load `convoy.toml` from the project root, or defaults if absent.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("convoy.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse convoy.toml")
    }

    /// Write the config back as a starter file (used by `convoy init`).
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize convoy.toml")?;
        std::fs::write(project_dir.join("convoy.toml"), content)
            .context("Failed to write convoy.toml")?;
        Ok(())
    }
}

/// Resolved runtime context for one project.
///
/// Bridges `convoy.toml` with the concrete on-disk layout under `.convoy/`.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project_dir: PathBuf,
    pub convoy_dir: PathBuf,
    pub store_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub workers_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub queue_file: PathBuf,
    pub integration_branch: String,
    pub remote: String,
    pub human_owner: String,
    pub queue_poll_secs: u64,
    pub worker_poll_secs: u64,
    pub retention_hours: u64,
    pub agent_cmd: String,
    pub tmux_cmd: String,
    pub gh_cmd: String,
    /// Identity recorded as the owning host on claimed operations.
    pub host: String,
}

impl ProjectContext {
    /// Resolve the context for a project directory (defaults to cwd).
    pub fn resolve(project_dir: Option<PathBuf>) -> Result<Self> {
        let project_dir = match project_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let toml = ConvoyToml::load(&project_dir)?;
        let convoy_dir = project_dir.join(".convoy");

        let host = std::env::var("CONVOY_HOST")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            store_dir: convoy_dir.join("store"),
            locks_dir: convoy_dir.join("locks"),
            workers_dir: convoy_dir.join("workers"),
            audit_dir: convoy_dir.join("audit"),
            worktrees_dir: convoy_dir.join("worktrees"),
            queue_file: convoy_dir.join("queue.json"),
            convoy_dir,
            project_dir,
            integration_branch: toml.project.integration_branch,
            remote: toml.project.remote,
            human_owner: toml.project.human_owner,
            queue_poll_secs: toml.daemon.queue_poll_secs,
            worker_poll_secs: toml.daemon.worker_poll_secs,
            retention_hours: toml.daemon.retention_hours,
            agent_cmd: toml.commands.agent_cmd,
            tmux_cmd: toml.commands.tmux_cmd,
            gh_cmd: toml.commands.gh_cmd,
            host,
        })
    }

    /// Whether `convoy init` has been run in this project.
    pub fn is_initialized(&self) -> bool {
        self.convoy_dir.exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.store_dir).context("Failed to create store directory")?;
        std::fs::create_dir_all(&self.locks_dir).context("Failed to create locks directory")?;
        std::fs::create_dir_all(&self.workers_dir).context("Failed to create workers directory")?;
        std::fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        std::fs::create_dir_all(&self.worktrees_dir)
            .context("Failed to create worktrees directory")?;
        Ok(())
    }
}
