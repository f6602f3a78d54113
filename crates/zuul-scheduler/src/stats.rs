//! Leader-elected stats emission (spec §4.K): exactly one scheduler in the
//! fleet holds `/scheduler/stats-election` at a time and emits, every
//! `stats.interval()`, per-component counts, event queue depths, and
//! per-pipeline current-item counts as structured `tracing` events. Losing
//! the election (or never winning it) is not an error — every other
//! scheduler just sits out, which is why this loop tolerates a failed
//! non-blocking lock attempt by retrying on the next tick rather than
//! treating it as a fatal condition.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use zuul_types::ComponentKind;
use zuul_zk::{lock, ZkError};

use crate::scheduler::Scheduler;

const ELECTION_PATH: &str = "/scheduler/stats-election";
const ELECTION_RETRY: Duration = Duration::from_secs(5);

pub async fn run(scheduler: Arc<Scheduler>) {
    loop {
        if scheduler.should_stop() {
            return;
        }

        match lock::acquire(scheduler.client.clone(), ELECTION_PATH, Some(Duration::ZERO)).await {
            Ok(held) => {
                info!("won stats leader election");
                emit_loop(&scheduler).await;
                let _ = held.release().await;
            }
            Err(ZkError::LockTimeout(_)) => {
                tokio::time::sleep(ELECTION_RETRY).await;
            }
            Err(e) => {
                warn!(error = %e, "stats election attempt failed");
                tokio::time::sleep(ELECTION_RETRY).await;
            }
        }
    }
}

/// Runs until the scheduler stops or a CS error suggests the lock is no
/// longer trustworthy (e.g. a disconnect), at which point [`run`] goes back
/// around and re-attempts the election.
async fn emit_loop(scheduler: &Scheduler) {
    let mut ticker = tokio::time::interval(scheduler.config.stats.interval());
    loop {
        ticker.tick().await;
        if scheduler.should_stop() {
            return;
        }
        if let Err(e) = emit_once(scheduler).await {
            warn!(error = %e, "stats emission failed, relinquishing leadership");
            return;
        }
    }
}

async fn emit_once(scheduler: &Scheduler) -> Result<(), ZkError> {
    const KINDS: [ComponentKind; 5] = [
        ComponentKind::Scheduler,
        ComponentKind::Executor,
        ComponentKind::Merger,
        ComponentKind::Launcher,
        ComponentKind::Web,
    ];
    for kind in KINDS {
        let count = scheduler.components.all_of_kind(kind).await?.len();
        info!(component = kind.as_str(), count, "component.count");
    }

    let global_depth = scheduler.global_management_queue().depth().await?;
    info!(queue = "management.global", depth = global_depth, "queue.depth");

    let tenants = scheduler.tenants.read().await;
    for (tenant_name, runtime) in tenants.iter() {
        let mgmt_depth = runtime.management_queue.depth().await?;
        let trigger_depth = runtime.trigger_queue.depth().await?;
        info!(tenant = %tenant_name, queue = "management", depth = mgmt_depth, "queue.depth");
        info!(tenant = %tenant_name, queue = "trigger", depth = trigger_depth, "queue.depth");

        for (pipeline_name, handle) in &runtime.pipelines {
            let pipeline_trigger_depth = handle.trigger_queue.depth().await?;
            let pipeline_result_depth = handle.result_queue.depth().await?;
            info!(
                tenant = %tenant_name,
                pipeline = %pipeline_name,
                queue = "pipeline-trigger",
                depth = pipeline_trigger_depth,
                "queue.depth"
            );
            info!(
                tenant = %tenant_name,
                pipeline = %pipeline_name,
                queue = "pipeline-result",
                depth = pipeline_result_depth,
                "queue.depth"
            );

            let mut item_count = 0usize;
            for queue_id in handle.store.all_queue_ids().await? {
                if let Some(queue) = handle.store.load_queue(&queue_id).await? {
                    item_count += queue.queue.len();
                }
            }
            info!(tenant = %tenant_name, pipeline = %pipeline_name, items = item_count, "pipeline.items");
        }
    }
    drop(tenants);

    let node_requests = match scheduler.client.children("/nodepool/requests").await {
        Ok(children) => children.len(),
        Err(e) if e.is_no_node() => 0,
        Err(e) => return Err(e),
    };
    info!(resource = "node_requests", count = node_requests, "resource.total");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_layout::UnparsedTenantConfig;
    use zuul_manager::{AlwaysMergeable, MemoryExecutorClient};
    use zuul_zk::MemoryCoordinationClient;

    use crate::config::SchedulerConfig;
    use crate::loader::StaticTenantConfigLoader;

    #[tokio::test]
    async fn emit_once_succeeds_with_no_tenants_loaded() {
        let client: Arc<dyn zuul_zk::CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let scheduler = Arc::new(Scheduler::new(
            client,
            SchedulerConfig::default(),
            Arc::new(MemoryExecutorClient::new()),
            Arc::new(AlwaysMergeable),
            Arc::new(StaticTenantConfigLoader::new()),
        ));
        scheduler.global_management_queue().ensure_root().await.unwrap();

        emit_once(&scheduler).await.unwrap();
    }

    #[tokio::test]
    async fn emit_once_counts_loaded_tenants_and_components() {
        let client: Arc<dyn zuul_zk::CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let scheduler = Arc::new(Scheduler::new(
            client,
            SchedulerConfig::default(),
            Arc::new(MemoryExecutorClient::new()),
            Arc::new(AlwaysMergeable),
            Arc::new(StaticTenantConfigLoader::new()),
        ));
        scheduler.register_component().await.unwrap();
        scheduler.global_management_queue().ensure_root().await.unwrap();
        scheduler
            .load_tenant("t1", UnparsedTenantConfig::default(), 5, Duration::from_secs(1800), vec![], vec![], vec![])
            .await
            .unwrap();

        emit_once(&scheduler).await.unwrap();

        let schedulers = scheduler.components.all_of_kind(ComponentKind::Scheduler).await.unwrap();
        assert_eq!(schedulers.len(), 1);
    }

    #[tokio::test]
    async fn only_one_scheduler_wins_the_election() {
        let client: Arc<dyn zuul_zk::CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let lock1 = lock::acquire(client.clone(), ELECTION_PATH, Some(Duration::ZERO)).await.unwrap();
        let second = lock::acquire(client.clone(), ELECTION_PATH, Some(Duration::ZERO)).await;
        assert!(matches!(second, Err(ZkError::LockTimeout(_))));
        lock1.release().await.unwrap();
    }
}
