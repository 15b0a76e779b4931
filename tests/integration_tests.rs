//! Integration tests for Convoy
//!
//! These tests drive the compiled binary end to end: project setup, the
//! operation lifecycle, and merge queue bookkeeping.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a convoy Command
fn convoy() -> Command {
    cargo_bin_cmd!("convoy")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Helper to initialize a convoy project in a temp directory
fn init_convoy_project(dir: &TempDir) {
    convoy()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_convoy_help() {
        convoy().arg("--help").assert().success();
    }

    #[test]
    fn test_convoy_version() {
        convoy().arg("--version").assert().success();
    }

    #[test]
    fn test_convoy_init_creates_structure() {
        let dir = create_temp_project();

        convoy()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized convoy project"));

        assert!(dir.path().join("convoy.toml").exists());
        assert!(dir.path().join(".convoy/store").exists());
        assert!(dir.path().join(".convoy/locks").exists());
        assert!(dir.path().join(".convoy/workers").exists());
        assert!(dir.path().join(".convoy/audit").exists());
        assert!(dir.path().join(".convoy/worktrees").exists());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("convoy.toml"),
            "[project]\nintegration_branch = \"develop\"\n",
        )
        .unwrap();
        init_convoy_project(&dir);

        let content = fs::read_to_string(dir.path().join("convoy.toml")).unwrap();
        assert!(content.contains("develop"));
    }

    #[test]
    fn test_commands_require_initialized_project() {
        let dir = create_temp_project();

        convoy()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("convoy init"));
    }
}

// =============================================================================
// Operation Lifecycle Tests
// =============================================================================

mod operations {
    use super::*;

    #[test]
    fn test_submit_and_status() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth", "--kind", "feature"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Submitted operation 'auth'"));

        convoy()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("auth"))
            .stdout(predicate::str::contains("init"));
    }

    #[test]
    fn test_duplicate_submit_is_rejected() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth", "--kind", "epic"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown operation kind"));
    }

    #[test]
    fn test_submit_after_unknown_dependency_fails() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "profile", "--after", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not exist"));
    }

    #[test]
    fn test_hold_resume_cycle() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["hold", "auth"])
            .assert()
            .success();

        convoy()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("held"));

        convoy()
            .current_dir(dir.path())
            .args(["resume", "auth"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Resumed 'auth'"));
    }

    #[test]
    fn test_resume_blocked_by_dependency_and_forced() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "base"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["submit", "dependent", "--after", "base"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["hold", "dependent"])
            .assert()
            .success();

        convoy()
            .current_dir(dir.path())
            .args(["resume", "dependent"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("has not merged"));

        convoy()
            .current_dir(dir.path())
            .args(["resume", "dependent", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn test_cancel_is_terminal() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["cancel", "auth"])
            .assert()
            .success();

        // A cancelled operation cannot be held.
        convoy()
            .current_dir(dir.path())
            .args(["hold", "auth"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("terminal"));
    }

    #[test]
    fn test_audit_records_lifecycle() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["hold", "auth"])
            .assert()
            .success();

        convoy()
            .current_dir(dir.path())
            .args(["audit", "auth"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"))
            .stdout(predicate::str::contains("Held"));
    }
}

// =============================================================================
// Merge Queue Tests
// =============================================================================

mod queue {
    use super::*;

    #[test]
    fn test_queue_add_and_show() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["queue", "add", "auth", "--priority", "5"])
            .assert()
            .success()
            .stdout(predicate::str::contains("priority 5"));

        convoy()
            .current_dir(dir.path())
            .args(["queue", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("auth"))
            .stdout(predicate::str::contains("pending"));
    }

    #[test]
    fn test_queue_add_unknown_operation_fails() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["queue", "add", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No operation named"));
    }

    #[test]
    fn test_queue_duplicate_add_is_rejected() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["queue", "add", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["queue", "add", "auth"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("non-terminal entry"));
    }

    #[test]
    fn test_queue_add_bare_branch() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["queue", "add", "hotfix/login", "--branch"])
            .assert()
            .success();

        convoy()
            .current_dir(dir.path())
            .args(["queue", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hotfix/login"));
    }

    #[test]
    fn test_status_counts_queue_entries() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["submit", "auth"])
            .assert()
            .success();
        convoy()
            .current_dir(dir.path())
            .args(["queue", "add", "auth"])
            .assert()
            .success();

        convoy()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("1 total"))
            .stdout(predicate::str::contains("1 pending"));
    }
}

// =============================================================================
// Worker CLI Tests
// =============================================================================

mod workers {
    use super::*;

    #[test]
    fn test_worker_rejects_unknown_kind() {
        let dir = create_temp_project();
        init_convoy_project(&dir);

        convoy()
            .current_dir(dir.path())
            .args(["worker", "feature"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown worker kind"));
    }
}
