//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                |
//! |-----------|-------------------------------------------------|
//! | `project` | `Init`, `Status`                                |
//! | `op`      | `Submit`, `Hold`, `Resume`, `Cancel`, `Audit`   |
//! | `queue`   | `Queue` (`add`, `show`, `prune`)                |
//! | `daemon`  | `MergeDaemon`, `Worker`                         |

pub mod daemon;
pub mod op;
pub mod project;
pub mod queue;

pub use daemon::{cmd_merge_daemon, cmd_worker};
pub use op::{cmd_audit, cmd_cancel, cmd_hold, cmd_resume, cmd_submit};
pub use project::{cmd_init, cmd_status};
pub use queue::{cmd_queue_add, cmd_queue_prune, cmd_queue_show};

use anyhow::Result;
use convoy::config::ProjectContext;

/// Commands other than `init` require a prepared project.
fn ensure_initialized(ctx: &ProjectContext) -> Result<()> {
    if !ctx.is_initialized() {
        anyhow::bail!(
            "No convoy project at {} (run `convoy init` first)",
            ctx.project_dir.display()
        );
    }
    Ok(())
}
