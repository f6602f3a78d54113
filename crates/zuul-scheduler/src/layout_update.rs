//! Background layout synchronization (spec §4.L): wakes on a remote-layout
//! change watch, and for every tenant whose `local_layout_state` is behind
//! the coordination store's copy, reloads that tenant's `Layout` through
//! the configured loader and swaps it in — the same fold
//! [`crate::reconfigure`] uses when the *scheduler itself* is the one
//! publishing the change, but here the publisher was some other scheduler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use zuul_layout::build_layout;
use zuul_types::TenantName;
use zuul_zk::lock;

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;

const POLL_FALLBACK: Duration = Duration::from_secs(10);

pub async fn run(scheduler: Arc<Scheduler>) {
    let mut watch = scheduler.client.watch_tree("/layout");
    loop {
        if scheduler.should_stop() {
            return;
        }

        tokio::select! {
            result = watch.recv() => {
                if result.is_err() {
                    // Lagged or closed: re-subscribe rather than spin on a
                    // dead receiver.
                    watch = scheduler.client.watch_tree("/layout");
                }
            }
            _ = tokio::time::sleep(POLL_FALLBACK) => {}
        }

        if scheduler.should_stop() {
            return;
        }

        if let Err(e) = pass(&scheduler).await {
            warn!(error = %e, "layout update pass failed");
        }
    }
}

async fn pass(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    let tenant_names: Vec<String> = scheduler.tenants.read().await.keys().cloned().collect();
    let mut updated_any = false;

    for name in tenant_names {
        let tenant_name = TenantName::from(name.as_str());
        let remote = scheduler.layout_store.get(&tenant_name).await?;
        let Some(remote) = remote else { continue };

        let local_ltime = {
            let tenants = scheduler.tenants.read().await;
            tenants.get(&name).and_then(|t| t.local_layout_state.as_ref().map(|s| s.ltime))
        };
        if local_ltime.is_some_and(|l| l >= remote.ltime) {
            continue;
        }

        let lock_path = format!("/locks/tenant/{name}");
        let held = match lock::acquire(scheduler.client.clone(), &lock_path, Some(Duration::ZERO)).await {
            Ok(held) => held,
            Err(zuul_zk::ZkError::LockTimeout(_)) => continue,
            Err(e) => return Err(e.into()),
        };

        let fresh = scheduler.config_loader().load(&name).await?;
        let layout = build_layout(&fresh);
        if layout.has_load_errors() {
            for err in &layout.loading_errors {
                warn!(tenant = %name, source = %err.source, message = %err.message, "layout reload produced load errors, keeping previous layout");
            }
            held.release().await?;
            continue;
        }

        scheduler.reload_tenant_layout(&name, fresh, layout).await?;
        info!(tenant = %name, ltime = remote.ltime, "local layout brought up to date with remote");
        updated_any = true;

        held.release().await?;
    }

    if updated_any {
        scheduler.wake_main_loop();
    }
    Ok(())
}
