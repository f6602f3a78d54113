//! Full, smart, and tenant-scoped reconfiguration (spec §4.F, §4.I): folding
//! a tenant's [`UnparsedTenantConfig`] into a fresh `Layout`, publishing it
//! through the [`LayoutStore`](zuul_layout::store::LayoutStore), reenqueuing
//! old queues whose pipelines changed shape, and bumping per-branch file
//! cache ltimes so a later reconfigure knows which cached files it can
//! still trust.

use chrono::Utc;
use tracing::{info, warn};
use zuul_layout::build_layout;
use zuul_layout::store::LayoutState;
use zuul_types::event::ManagementEvent;
use zuul_types::{Event, LayoutId, TenantName};

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;

/// Drains the scheduler-global management queue, which carries
/// reconfigure-only commands (the ones the command socket issues directly
/// rather than going through a tenant's own queue) — spec §4.I "process
/// global management event queue (reconfigure events only)".
pub async fn drain_global_management(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    let events = scheduler.global_management_queue().poll_merged().await?;
    for event in events {
        match &event.payload {
            ManagementEvent::FullReconfigure => full_reconfigure(scheduler).await?,
            ManagementEvent::SmartReconfigure => smart_reconfigure(scheduler).await?,
            ManagementEvent::TenantReconfigure { tenant, project_branches } => {
                tenant_reconfigure(scheduler, &tenant.to_string(), project_branches).await?
            }
            other => {
                warn!(?other, "non-reconfigure event on global management queue, dropping");
            }
        }
        scheduler.global_management_queue().ack(&event.ack_ref).await?;
    }
    Ok(())
}

/// Handles one reconfigure-kind event found on a *tenant*-scoped management
/// queue (only `TenantReconfigure` should land there in practice, but
/// `FullReconfigure`/`SmartReconfigure` are honored too rather than
/// silently dropped, since nothing prevents an operator from enqueuing one
/// there).
pub async fn handle_reconfigure_event(
    scheduler: &Scheduler,
    tenant: &str,
    event: &Event<ManagementEvent>,
) -> Result<(), SchedulerError> {
    match &event.payload {
        ManagementEvent::FullReconfigure => full_reconfigure(scheduler).await,
        ManagementEvent::SmartReconfigure => smart_reconfigure(scheduler).await,
        ManagementEvent::TenantReconfigure { project_branches, .. } => {
            tenant_reconfigure(scheduler, tenant, project_branches).await
        }
        _ => Ok(()),
    }
}

/// Re-reads every tenant's unparsed config and reloads it unconditionally
/// (spec §4.I "Full").
pub async fn full_reconfigure(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    info!("full reconfigure starting");
    let names: Vec<String> = scheduler.tenants.read().await.keys().cloned().collect();
    for name in names {
        reload_tenant(scheduler, &name, &[]).await?;
    }
    scheduler.wake_main_loop();
    Ok(())
}

/// Like [`full_reconfigure`] but skips any tenant whose unparsed config is
/// byte-for-byte unchanged since its last reload (spec §4.I "Smart").
pub async fn smart_reconfigure(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    info!("smart reconfigure starting");
    let names: Vec<String> = scheduler.tenants.read().await.keys().cloned().collect();
    for name in names {
        let unchanged = {
            let tenants = scheduler.tenants.read().await;
            tenants
                .get(&name)
                .map(|t| serde_json::to_vec(&t.unparsed).unwrap_or_default())
        };
        let Some(current_bytes) = unchanged else { continue };
        let fresh = scheduler.config_loader().load(&name).await?;
        let fresh_bytes = serde_json::to_vec(&fresh).unwrap_or_default();
        if fresh_bytes == current_bytes {
            continue;
        }
        reload_tenant(scheduler, &name, &[]).await?;
    }
    scheduler.wake_main_loop();
    Ok(())
}

/// Reloads exactly one tenant and bumps the file-cache min-ltime for every
/// `(project, branch)` pair the triggering event named, so a later
/// reconfigure knows not to trust a cached file read before this one
/// (spec §4.F, §4.I).
pub async fn tenant_reconfigure(
    scheduler: &Scheduler,
    tenant: &str,
    project_branches: &[(String, String)],
) -> Result<(), SchedulerError> {
    info!(tenant = %tenant, "tenant reconfigure starting");
    reload_tenant(scheduler, tenant, project_branches).await?;
    scheduler.wake_main_loop();
    Ok(())
}

async fn reload_tenant(
    scheduler: &Scheduler,
    tenant: &str,
    invalidated_branches: &[(String, String)],
) -> Result<(), SchedulerError> {
    let fresh = scheduler.config_loader().load(tenant).await?;
    let layout = build_layout(&fresh);

    if layout.has_load_errors() {
        // spec §7 ConfigurationSyntaxError: the offending tenant keeps its
        // last-good Layout. The errors still get recorded so a caller (the
        // not-yet-built web API) can surface them, but we do not swap the
        // running tenant out for a broken one.
        for err in &layout.loading_errors {
            warn!(tenant = %tenant, source = %err.source, message = %err.message, "reconfigure produced load errors, keeping previous layout");
        }
        return Ok(());
    }

    let pipelines_changed = {
        let tenants = scheduler.tenants.read().await;
        tenants
            .get(tenant)
            .map(|t| t.tenant.pipelines_changed_since(&layout))
            .unwrap_or_default()
    };

    let ltime = scheduler.layout_store.get(&TenantName::from(tenant)).await?;
    let state = LayoutState {
        uuid: LayoutId::new(),
        ltime: ltime.map(|s| s.ltime).unwrap_or(0),
        hostname: scheduler.config.component.hostname.clone(),
        last_reconfigured: Utc::now(),
    };
    let published = scheduler.layout_store.set(&TenantName::from(tenant), state).await?;

    for (project, branch) in invalidated_branches {
        scheduler
            .layout_store
            .bump_min_ltime(&TenantName::from(tenant), project, branch, published.ltime)
            .await?;
    }

    reenqueue_changed_pipelines(scheduler, tenant, &pipelines_changed).await?;

    scheduler
        .reload_tenant_layout(tenant, fresh, layout)
        .await?;

    info!(tenant = %tenant, changed = ?pipelines_changed, "tenant reconfigured");
    Ok(())
}

/// A pipeline whose structural shape changed (manager kind, queue names, or
/// window policy) can't safely keep its old `ChangeQueue`s in place — they
/// are moved aside into `old_queues` so the next processing pass can walk
/// their items and re-add them under the new structure (spec §4.G, §4.I,
/// seed scenario 6: "old queue is reenqueued under the new Layout; builds
/// whose job still exists are preserved").
async fn reenqueue_changed_pipelines(
    scheduler: &Scheduler,
    tenant: &str,
    changed: &[String],
) -> Result<(), SchedulerError> {
    if changed.is_empty() {
        return Ok(());
    }
    let tenants = scheduler.tenants.read().await;
    let Some(runtime) = tenants.get(tenant) else {
        return Ok(());
    };
    for pipeline_name in changed {
        let Some(handle) = runtime.pipelines.get(pipeline_name) else {
            continue;
        };
        for queue_id in handle.store.all_queue_ids().await? {
            if let Some(queue) = handle.store.load_queue(&queue_id).await? {
                if !queue.is_empty() {
                    handle.store.move_to_old_queues(&queue).await?;
                }
            }
        }
        handle.store.set_dirty().await?;
    }
    Ok(())
}
