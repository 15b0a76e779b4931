//! Project initialization and status commands.

use anyhow::Result;
use convoy::config::{ConvoyToml, ProjectContext};
use convoy::status;

pub fn cmd_init(ctx: &ProjectContext) -> Result<()> {
    let was_initialized = ctx.is_initialized();
    ctx.ensure_directories()?;
    if !ctx.project_dir.join("convoy.toml").exists() {
        ConvoyToml::default().save(&ctx.project_dir)?;
    }

    if was_initialized {
        println!(
            "Convoy project already initialized at {}",
            ctx.convoy_dir.display()
        );
        println!("Directory structure verified.");
    } else {
        println!("Initialized convoy project at {}", ctx.convoy_dir.display());
        println!();
        println!("Created directory structure:");
        println!("  convoy.toml     # Project settings");
        println!("  .convoy/");
        println!("  ├── store/      # Operation records");
        println!("  ├── locks/      # Advisory lock markers");
        println!("  ├── workers/    # Worker daemon state");
        println!("  ├── audit/      # Per-operation event logs");
        println!("  └── worktrees/  # Isolated agent workspaces");
        println!();
        println!("Next steps:");
        println!("  1. Run `convoy submit <name>` to register work");
        println!("  2. Run `convoy merge-daemon` to start integrating");
        println!("  3. Run `convoy worker fix` to work labeled tracker items");
    }
    Ok(())
}

pub fn cmd_status(ctx: &ProjectContext) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let snap = status::snapshot(ctx)?;

    println!("{}", console::style("Operations").bold().cyan());
    if snap.operations.is_empty() {
        println!("  (none)");
    }
    for row in &snap.operations {
        let mut markers = Vec::new();
        if row.held {
            markers.push("held".to_string());
        }
        if row.blocked {
            let after = row.after.as_deref().unwrap_or("?");
            markers.push(format!("blocked on {}", after));
        }
        let marker_text = if markers.is_empty() {
            String::new()
        } else {
            format!(" [{}]", markers.join(", "))
        };
        println!(
            "  {:<24} {:<8} {}{}",
            row.name,
            row.kind.to_string(),
            row.phase,
            console::style(marker_text).yellow()
        );
        if let Some(reason) = &row.reason {
            println!("    {} {}", console::style("reason:").dim(), reason);
        }
    }

    println!();
    println!("{}", console::style("Merge queue").bold().cyan());
    let q = &snap.queue;
    println!(
        "  {} total: {} pending, {} processing, {} completed, {} failed, {} conflict",
        q.total, q.pending, q.processing, q.completed, q.failed, q.conflict
    );

    if let Some(marker) = &snap.queue_lock {
        println!(
            "  queue lock held by {} (pid {})",
            marker.holder, marker.pid
        );
    }
    if let Some(marker) = &snap.merge_lock {
        println!(
            "  merge lock held by {} (pid {})",
            marker.holder, marker.pid
        );
    }
    Ok(())
}
