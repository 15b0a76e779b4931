//! Operation lifecycle commands.

use anyhow::Result;
use convoy::audit::AuditLog;
use convoy::config::ProjectContext;
use convoy::op::{OpKind, Operation, StateMachine};
use convoy::store::OperationStore;
use convoy::workspace::WorkspaceProvisioner;

fn machine_parts(ctx: &ProjectContext) -> (OperationStore, AuditLog) {
    (
        OperationStore::new(ctx.store_dir.clone()),
        AuditLog::new(ctx.audit_dir.clone()),
    )
}

pub async fn cmd_submit(
    ctx: &ProjectContext,
    name: &str,
    kind: &str,
    after: Option<&str>,
    prompt: Option<&str>,
    provision: bool,
) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let kind: OpKind = kind.parse()?;
    let (store, audit) = machine_parts(ctx);
    let machine = StateMachine::new(&store, &audit);

    let mut op = Operation::new(name, kind);
    if let Some(after) = after {
        op = op.with_after(after);
    }
    op.prompt = prompt.map(String::from);
    op.host = Some(ctx.host.clone());
    machine.create(op)?;
    println!("Submitted operation '{}' ({})", name, kind);

    if provision {
        let ws = WorkspaceProvisioner::new(ctx);
        let (path, branch) = ws.provision(name).await?;
        store.update(name, |op| {
            op.worktree = Some(path.clone());
            op.branch = Some(branch.clone());
        })?;
        println!("Workspace at {} on branch {}", path.display(), branch);
    }
    Ok(())
}

pub fn cmd_hold(ctx: &ProjectContext, name: &str) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let (store, audit) = machine_parts(ctx);
    let op = StateMachine::new(&store, &audit).hold(name)?;
    println!(
        "Held '{}' (was {})",
        name,
        op.prior_phase.unwrap_or(op.phase)
    );
    Ok(())
}

pub fn cmd_resume(ctx: &ProjectContext, name: &str, force: bool) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let (store, audit) = machine_parts(ctx);
    let op = StateMachine::new(&store, &audit).resume(name, force)?;
    println!("Resumed '{}' at {}", name, op.phase);
    Ok(())
}

pub fn cmd_cancel(ctx: &ProjectContext, name: &str) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let (store, audit) = machine_parts(ctx);
    StateMachine::new(&store, &audit).cancel(name)?;
    println!("Cancelled '{}'", name);
    Ok(())
}

pub fn cmd_audit(ctx: &ProjectContext, name: &str) -> Result<()> {
    super::ensure_initialized(ctx)?;
    let audit = AuditLog::new(ctx.audit_dir.clone());
    let events = audit.read(name)?;
    if events.is_empty() {
        println!("No audit events for '{}'", name);
        return Ok(());
    }
    for event in events {
        let detail = event
            .detail
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        println!(
            "  {}  {:?}{}",
            event.at.format("%Y-%m-%d %H:%M:%S"),
            event.kind,
            console::style(detail).dim()
        );
    }
    Ok(())
}
