//! Workspace provisioning and the VCS contract.
//!
//! Each operation works in an isolated git worktree on its own branch,
//! created at a deterministic path under `.convoy/worktrees/`. Worktree and
//! merge plumbing shells out to the `git` CLI; in-repo queries (cleanliness,
//! ancestry, commit counts) go through `git2`.

use crate::config::ProjectContext;
use crate::errors::QueueError;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::warn;

/// Outcome of an integration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Textual conflict: the merge was aborted and the integration branch
    /// restored. Retry policy belongs to the queue, not to us.
    Conflict,
    /// Non-conflict failure (bad ref, dirty integration checkout, ...).
    Failed(String),
}

pub struct WorkspaceProvisioner {
    project_dir: PathBuf,
    worktrees_dir: PathBuf,
    remote: String,
    integration_branch: String,
}

impl WorkspaceProvisioner {
    pub fn new(ctx: &ProjectContext) -> Self {
        Self {
            project_dir: ctx.project_dir.clone(),
            worktrees_dir: ctx.worktrees_dir.clone(),
            remote: ctx.remote.clone(),
            integration_branch: ctx.integration_branch.clone(),
        }
    }

    /// Deterministic workspace path for an operation.
    pub fn workspace_path(&self, name: &str) -> PathBuf {
        self.worktrees_dir.join(name)
    }

    pub fn branch_name(&self, name: &str) -> String {
        format!("convoy/{}", name)
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    /// Create (or reuse) the worktree and branch for an operation.
    pub async fn provision(&self, name: &str) -> Result<(PathBuf, String)> {
        let path = self.workspace_path(name);
        let branch = self.branch_name(name);

        if path.exists() {
            return Ok((path, branch));
        }

        tokio::fs::create_dir_all(&self.worktrees_dir)
            .await
            .context("Failed to create worktrees directory")?;
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        let output = self
            .git(
                &self.project_dir,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    path_str,
                    &self.integration_branch,
                ],
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree creation failed: {}", stderr.trim());
        }
        Ok((path, branch))
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("Failed to run git worktree remove")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree remove failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Hard-reset a workspace to the integration branch's tip. Fetches the
    /// remote first; without a reachable remote the local tip is used.
    pub async fn reset_to_integration_tip(&self, path: &Path) -> Result<()> {
        let fetch = self
            .git(path, &["fetch", &self.remote, &self.integration_branch])
            .await?;
        let target = if fetch.status.success() {
            format!("{}/{}", self.remote, self.integration_branch)
        } else {
            warn!(
                remote = %self.remote,
                "fetch failed, resetting to local integration tip"
            );
            self.integration_branch.clone()
        };
        let output = self.git(path, &["reset", "--hard", &target]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git reset to {} failed: {}", target, stderr.trim());
        }
        Ok(())
    }

    /// Whether a workspace has no uncommitted changes (staged, unstaged, or
    /// untracked).
    pub fn is_clean(&self, path: &Path) -> Result<bool> {
        let repo = git2::Repository::open(path)
            .with_context(|| format!("Failed to open workspace repo at {}", path.display()))?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .context("Failed to read workspace status")?;
        Ok(statuses.is_empty())
    }

    fn branch_tip(&self, repo: &git2::Repository, branch: &str) -> Result<git2::Oid> {
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)
            .with_context(|| format!("Branch {} not found", branch))?;
        reference
            .get()
            .target()
            .with_context(|| format!("Branch {} has no target", branch))
    }

    /// Whether `branch` is already an ancestor of the integration branch
    /// (i.e. its work is contained in the integration history).
    pub fn branch_is_ancestor(&self, branch: &str) -> Result<bool> {
        let repo = git2::Repository::open(&self.project_dir)
            .context("Failed to open project repository")?;
        let branch_tip = self.branch_tip(&repo, branch)?;
        let integration_tip = self.branch_tip(&repo, &self.integration_branch)?;
        if branch_tip == integration_tip {
            return Ok(true);
        }
        repo.graph_descendant_of(integration_tip, branch_tip)
            .context("Ancestry check failed")
    }

    /// Whether `branch` carries commits the integration branch lacks.
    pub fn has_commits_ahead(&self, branch: &str) -> Result<bool> {
        let repo = git2::Repository::open(&self.project_dir)
            .context("Failed to open project repository")?;
        let branch_tip = self.branch_tip(&repo, branch)?;
        let integration_tip = self.branch_tip(&repo, &self.integration_branch)?;
        let (ahead, _behind) = repo
            .graph_ahead_behind(branch_tip, integration_tip)
            .context("Ahead/behind computation failed")?;
        Ok(ahead > 0)
    }

    /// Resolve a worktree path back to its originating repository workdir.
    pub fn resolve_repo(path: &Path) -> Result<PathBuf> {
        let repo = git2::Repository::discover(path)
            .with_context(|| format!("No repository found from {}", path.display()))?;
        if repo.is_worktree() {
            // commondir is the main repository's .git directory.
            let main = repo
                .commondir()
                .parent()
                .context("Worktree commondir has no parent")?
                .to_path_buf();
            Ok(main)
        } else {
            Ok(repo
                .workdir()
                .context("Repository has no working directory")?
                .to_path_buf())
        }
    }

    pub async fn push_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let output = self.git(path, &["push", &self.remote, branch]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git push of {} failed: {}", branch, stderr.trim());
        }
        Ok(())
    }

    pub async fn push_integration(&self) -> Result<()> {
        let output = self
            .git(
                &self.project_dir,
                &["push", &self.remote, &self.integration_branch],
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git push of {} failed: {}",
                self.integration_branch,
                stderr.trim()
            );
        }
        Ok(())
    }

    /// Whether the configured remote exists in the repository. Local-only
    /// projects skip push and remote-branch bookkeeping entirely.
    pub fn has_remote(&self) -> bool {
        git2::Repository::open(&self.project_dir)
            .and_then(|repo| repo.find_remote(&self.remote).map(|_| ()))
            .is_ok()
    }

    /// Check whether a branch exists on the remote.
    ///
    /// A failed `ls-remote` execution is NOT "branch absent" — it surfaces
    /// as [`QueueError::RemoteCheck`] so callers never prune live work on a
    /// transient remote failure.
    pub async fn remote_branch_exists(&self, branch: &str) -> Result<bool, QueueError> {
        let output = Command::new("git")
            .args([
                "ls-remote",
                "--heads",
                &self.remote,
                &format!("refs/heads/{}", branch),
            ])
            .current_dir(&self.project_dir)
            .output()
            .await
            .map_err(|e| QueueError::RemoteCheck(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QueueError::RemoteCheck(stderr.trim().to_string()));
        }
        Ok(!output.stdout.is_empty())
    }

    pub async fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        let output = self
            .git(&self.project_dir, &["push", &self.remote, "--delete", branch])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Remote branch deletion of {} failed: {}", branch, stderr.trim());
        }
        Ok(())
    }

    /// Merge `branch` into the integration branch in the main checkout.
    ///
    /// Not safe for concurrent use — the caller must hold the merge lock.
    /// On any failure the integration checkout is restored to its original
    /// branch before returning.
    pub async fn merge_into_integration(&self, branch: &str) -> Result<MergeOutcome> {
        let head = self
            .git(&self.project_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let original = String::from_utf8_lossy(&head.stdout).trim().to_string();

        let checkout = self
            .git(&self.project_dir, &["checkout", &self.integration_branch])
            .await?;
        if !checkout.status.success() {
            let stderr = String::from_utf8_lossy(&checkout.stderr);
            return Ok(MergeOutcome::Failed(format!(
                "checkout of {} failed: {}",
                self.integration_branch,
                stderr.trim()
            )));
        }

        let merge = self
            .git(
                &self.project_dir,
                &[
                    "merge",
                    "--no-ff",
                    "-m",
                    &format!("Merge {}", branch),
                    branch,
                ],
            )
            .await?;

        if merge.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let conflicted = self.merge_in_progress().await?;
        if conflicted {
            let abort = self.git(&self.project_dir, &["merge", "--abort"]).await?;
            if !abort.status.success() {
                warn!(branch, "merge --abort failed after conflict");
            }
        }
        self.restore_checkout(&original).await;

        if conflicted {
            Ok(MergeOutcome::Conflict)
        } else {
            let stderr = String::from_utf8_lossy(&merge.stderr);
            let stdout = String::from_utf8_lossy(&merge.stdout);
            Ok(MergeOutcome::Failed(format!(
                "{} {}",
                stdout.trim(),
                stderr.trim()
            )))
        }
    }

    async fn merge_in_progress(&self) -> Result<bool> {
        let output = self
            .git(
                &self.project_dir,
                &["rev-parse", "-q", "--verify", "MERGE_HEAD"],
            )
            .await?;
        Ok(output.status.success())
    }

    async fn restore_checkout(&self, original: &str) {
        if original.is_empty() || original == self.integration_branch {
            return;
        }
        match self.git(&self.project_dir, &["checkout", original]).await {
            Ok(out) if !out.status.success() => {
                warn!(branch = original, "checkout restore failed");
            }
            Err(e) => warn!(branch = original, error = %e, "checkout restore failed"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectContext;
    use std::fs;
    use tempfile::tempdir;

    fn run_git(dir: &Path, args: &[&str]) {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn setup_project(dir: &Path) -> WorkspaceProvisioner {
        run_git(dir, &["init", "-b", "main"]);
        run_git(dir, &["config", "user.name", "test"]);
        run_git(dir, &["config", "user.email", "test@test.com"]);
        fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-m", "init"]);
        let ctx = ProjectContext::resolve(Some(dir.to_path_buf())).unwrap();
        WorkspaceProvisioner::new(&ctx)
    }

    fn commit_file(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-m", name]);
    }

    #[tokio::test]
    async fn test_provision_creates_worktree_and_branch() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let (path, branch) = ws.provision("auth").await.unwrap();
        assert!(path.exists());
        assert_eq!(branch, "convoy/auth");
        assert!(path.ends_with(".convoy/worktrees/auth"));
        // Second provision reuses the existing workspace.
        let (again, _) = ws.provision("auth").await.unwrap();
        assert_eq!(path, again);
    }

    #[tokio::test]
    async fn test_is_clean_tracks_uncommitted_changes() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let (path, _) = ws.provision("auth").await.unwrap();
        assert!(ws.is_clean(&path).unwrap());
        fs::write(path.join("wip.txt"), "dirty").unwrap();
        assert!(!ws.is_clean(&path).unwrap());
    }

    #[tokio::test]
    async fn test_ancestry_and_ahead_checks() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let (path, branch) = ws.provision("auth").await.unwrap();

        // Fresh branch: ancestor of main, nothing ahead.
        assert!(ws.branch_is_ancestor(&branch).unwrap());
        assert!(!ws.has_commits_ahead(&branch).unwrap());

        commit_file(&path, "feature.rs", "fn f() {}\n");
        assert!(!ws.branch_is_ancestor(&branch).unwrap());
        assert!(ws.has_commits_ahead(&branch).unwrap());

        // After merging, the branch is contained in the integration history.
        let outcome = ws.merge_into_integration(&branch).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(ws.branch_is_ancestor(&branch).unwrap());
    }

    #[tokio::test]
    async fn test_merge_conflict_is_detected_and_aborted() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let (path, branch) = ws.provision("auth").await.unwrap();

        commit_file(&path, "shared.txt", "worker version\n");
        commit_file(dir.path(), "shared.txt", "main version\n");

        let outcome = ws.merge_into_integration(&branch).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Conflict);
        // Integration checkout restored and clean.
        let repo = git2::Repository::open(dir.path()).unwrap();
        assert!(repo.state() == git2::RepositoryState::Clean);
    }

    #[tokio::test]
    async fn test_merge_missing_branch_is_failure_not_conflict() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let outcome = ws.merge_into_integration("convoy/ghost").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_remote_branch_exists_with_real_remote() {
        let project = tempdir().unwrap();
        let remote = tempdir().unwrap();
        run_git(remote.path(), &["init", "--bare", "-b", "main"]);
        let ws = setup_project(project.path());
        run_git(
            project.path(),
            &["remote", "add", "origin", remote.path().to_str().unwrap()],
        );
        let (path, branch) = ws.provision("auth").await.unwrap();
        commit_file(&path, "feature.rs", "fn f() {}\n");

        assert!(!ws.remote_branch_exists(&branch).await.unwrap());
        ws.push_branch(&path, &branch).await.unwrap();
        assert!(ws.remote_branch_exists(&branch).await.unwrap());
        ws.delete_remote_branch(&branch).await.unwrap();
        assert!(!ws.remote_branch_exists(&branch).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_check_failure_is_ambiguous_not_negative() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        run_git(
            dir.path(),
            &["remote", "add", "origin", "/nonexistent/remote/repo"],
        );
        let err = ws.remote_branch_exists("convoy/auth").await.unwrap_err();
        assert!(matches!(err, QueueError::RemoteCheck(_)));
    }

    #[tokio::test]
    async fn test_remove_worktree() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let (path, _) = ws.provision("auth").await.unwrap();
        ws.remove(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reset_to_integration_tip_discards_commits() {
        let dir = tempdir().unwrap();
        let ws = setup_project(dir.path());
        let (path, branch) = ws.provision("auth").await.unwrap();
        commit_file(&path, "stray.rs", "fn s() {}\n");
        assert!(ws.has_commits_ahead(&branch).unwrap());
        ws.reset_to_integration_tip(&path).await.unwrap();
        assert!(!ws.has_commits_ahead(&branch).unwrap());
    }

    #[test]
    fn test_resolve_repo_from_nested_path() {
        let dir = tempdir().unwrap();
        setup_project(dir.path());
        let nested = dir.path().join("src/deep");
        fs::create_dir_all(&nested).unwrap();
        let resolved = WorkspaceProvisioner::resolve_repo(&nested).unwrap();
        assert_eq!(
            resolved.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
