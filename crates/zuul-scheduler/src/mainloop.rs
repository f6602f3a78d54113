//! The scheduler main loop (spec §4.I): a single wake-driven task that
//! drains the global (reconfigure-only) management queue, then for every
//! tenant drains its management queue (promote/enqueue/dequeue plus
//! tenant-reconfigure), fans trigger events out into matching pipelines,
//! and finally gives each pipeline a non-blocking processing pass.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info_span, warn, Instrument};
use zuul_events::ManagementEventQueue;
use zuul_layout::Layout;
use zuul_manager::PipelineRuntime;
use zuul_pipeline_state::{ChangeQueue, PipelineStateStore};
use zuul_types::event::ManagementEvent;
use zuul_types::{Event, ItemId, TriggerEvent};
use zuul_zk::lock;

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::tenant::PipelineHandle;

pub async fn run(scheduler: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(scheduler.config.main_loop_tick());
    loop {
        if scheduler.should_stop() {
            return;
        }
        tokio::select! {
            _ = scheduler.wake.notified() => {}
            _ = ticker.tick() => {}
        }
        if scheduler.should_stop() {
            return;
        }
        if let Err(e) = pass(&scheduler).await {
            warn!(error = %e, "scheduler main loop pass failed");
        }
    }
}

async fn pass(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    crate::reconfigure::drain_global_management(scheduler).await?;

    let tenant_names: Vec<String> = scheduler.tenants.read().await.keys().cloned().collect();
    for tenant_name in tenant_names {
        if let Err(e) = process_tenant(scheduler, &tenant_name).await {
            warn!(tenant = %tenant_name, error = %e, "tenant pass failed");
        }
    }
    Ok(())
}

async fn process_tenant(scheduler: &Scheduler, tenant_name: &str) -> Result<(), SchedulerError> {
    let tenants = scheduler.tenants.read().await;
    let Some(runtime) = tenants.get(tenant_name) else {
        return Ok(());
    };

    let mgmt_events = runtime.management_queue.poll_merged().await?;
    let mut per_pipeline: std::collections::BTreeMap<String, Vec<Event<ManagementEvent>>> =
        std::collections::BTreeMap::new();

    for event in mgmt_events {
        match &event.payload {
            ManagementEvent::FullReconfigure
            | ManagementEvent::SmartReconfigure
            | ManagementEvent::TenantReconfigure { .. } => {
                crate::reconfigure::handle_reconfigure_event(scheduler, tenant_name, &event).await?;
                runtime.management_queue.ack(&event.ack_ref).await?;
            }
            ManagementEvent::Promote { pipeline, .. }
            | ManagementEvent::Enqueue { pipeline, .. }
            | ManagementEvent::Dequeue { pipeline, .. } => {
                per_pipeline.entry(pipeline.clone()).or_default().push(event);
            }
        }
    }

    fan_out_trigger_events(&runtime.trigger_queue, runtime).await?;

    for (pipeline_name, handle) in &runtime.pipelines {
        let mgmt = per_pipeline.remove(pipeline_name).unwrap_or_default();
        let span = info_span!("pipeline", tenant = %tenant_name, pipeline = %pipeline_name);
        if let Err(e) =
            process_pipeline(scheduler, tenant_name, &runtime.tenant.layout, handle, mgmt, &runtime.management_queue)
                .instrument(span)
                .await
        {
            warn!(tenant = %tenant_name, pipeline = %pipeline_name, error = %e, "pipeline pass failed");
        }
    }

    // A promote/enqueue/dequeue naming a pipeline this tenant no longer
    // configures has nowhere to go; drop it with a loud warning rather than
    // leaving it stuck in the queue forever.
    for (pipeline_name, events) in per_pipeline {
        for event in events {
            warn!(tenant = %tenant_name, pipeline = %pipeline_name, "management event for unknown pipeline, dropping");
            runtime.management_queue.ack(&event.ack_ref).await?;
        }
    }

    Ok(())
}

/// Copies every tenant-wide trigger event a pipeline's manager claims into
/// that pipeline's own trigger queue, then acks the tenant-wide copy — the
/// "forward into each matching pipeline's trigger queue" step (spec §4.I).
/// An event no pipeline claims is acked and dropped.
async fn fan_out_trigger_events(
    queue: &zuul_events::TriggerEventQueue,
    runtime: &crate::tenant::TenantRuntime,
) -> Result<(), SchedulerError> {
    let events = queue.poll().await?;
    for event in events {
        let mut claimed = false;
        for handle in runtime.pipelines.values() {
            if handle.manager.event_matches(&event.payload) {
                handle.trigger_queue.enqueue(&event.payload).await?;
                claimed = true;
            }
        }
        if !claimed {
            debug!(change = %event.payload.change, "trigger event matched no pipeline");
        }
        queue.ack(&event.ack_ref).await?;
    }
    Ok(())
}

/// One pipeline's processing pass: non-blocking lock, dirty/pending check,
/// load working state, apply management then result then trigger events,
/// run `processQueue` to quiescence, persist, clear dirty (spec §4.H,
/// §4.I). A lock that's already held elsewhere is not an error — it just
/// means another scheduler (or a previous, still-running pass) owns this
/// pipeline's turn, so this pass is skipped outright.
async fn process_pipeline(
    scheduler: &Scheduler,
    tenant: &str,
    layout: &Layout,
    handle: &PipelineHandle,
    mgmt_events: Vec<Event<ManagementEvent>>,
    management_queue: &ManagementEventQueue,
) -> Result<(), SchedulerError> {
    let lock_path = format!("/locks/pipeline/{tenant}/{}", handle.pipeline_name());
    let lock = match lock::acquire(scheduler.client.clone(), &lock_path, Some(Duration::ZERO)).await {
        Ok(lock) => lock,
        Err(zuul_zk::ZkError::LockTimeout(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let result_events = handle.result_queue.poll().await?;
    let trigger_events = handle.trigger_queue.poll().await?;
    let dirty = handle.store.is_dirty().await?;

    if !dirty && mgmt_events.is_empty() && result_events.is_empty() && trigger_events.is_empty() {
        lock.release().await?;
        return Ok(());
    }

    let mut runtime = load_runtime(&handle.store).await?;
    reenqueue_old_queues(handle, &mut runtime, layout).await?;
    let before_queue_ids: BTreeSet<String> = runtime.queues.iter().map(|q| q.id.clone()).collect();
    let before_item_ids: HashSet<ItemId> = runtime.items.keys().copied().collect();

    apply_management_events(handle, &mut runtime, layout, &mgmt_events).await?;
    for event in &result_events {
        apply_result_event(&mut runtime, &event.payload);
    }
    apply_trigger_events(handle, &mut runtime, layout, &trigger_events).await?;

    loop {
        let changed = handle.manager.process_queue(&mut runtime, layout).await?;
        if !changed {
            break;
        }
    }

    persist_runtime(&handle.store, &runtime, &before_queue_ids, &before_item_ids).await?;

    for event in &mgmt_events {
        management_queue.ack(&event.ack_ref).await?;
    }
    for event in &result_events {
        handle.result_queue.ack(&event.ack_ref).await?;
    }
    for event in &trigger_events {
        handle.trigger_queue.ack(&event.ack_ref).await?;
    }
    handle.store.clear_dirty().await?;

    lock.release().await?;
    Ok(())
}

async fn apply_management_events(
    handle: &PipelineHandle,
    runtime: &mut PipelineRuntime,
    layout: &Layout,
    events: &[Event<ManagementEvent>],
) -> Result<(), SchedulerError> {
    for event in events {
        match &event.payload {
            ManagementEvent::Promote { queue, .. } => {
                handle.manager.promote_queue(runtime, queue);
            }
            ManagementEvent::Enqueue {
                project, change, ..
            } => {
                let job_graph = resolve_job_graph(layout, handle.pipeline_name(), project);
                if job_graph.is_empty() {
                    warn!(
                        project = %project, change = %change, pipeline = %handle.pipeline_name(),
                        "no jobs configured for this project in this pipeline, skipping enqueue"
                    );
                    continue;
                }
                let req = zuul_manager::AddChangeRequest::new(
                    format!("{project}:{change}"),
                    true,
                    job_graph,
                );
                handle.manager.add_change(runtime, req).await?;
            }
            ManagementEvent::Dequeue { change, .. } => {
                if let Some(item) = runtime.find_live_item(change) {
                    handle.manager.remove_item(runtime, layout, item).await?;
                }
            }
            _ => unreachable!("reconfigure events are filtered out before reaching this point"),
        }
    }
    Ok(())
}

fn apply_result_event(runtime: &mut PipelineRuntime, event: &zuul_types::event::ResultEvent) {
    use zuul_types::event::ResultEvent;
    match event {
        ResultEvent::BuildStarted { build, worker } => {
            for buildset in runtime.buildsets.values_mut() {
                if let Some(b) = buildset.builds.values_mut().find(|b| b.id == *build) {
                    b.worker_info = Some(worker.clone());
                    b.start_time.get_or_insert_with(chrono::Utc::now);
                }
            }
        }
        ResultEvent::BuildPaused { build } => {
            for buildset in runtime.buildsets.values_mut() {
                if let Some(b) = buildset.builds.values_mut().find(|b| b.id == *build) {
                    b.paused = true;
                }
            }
        }
        ResultEvent::BuildCompleted {
            build,
            result,
            warnings,
            end_time,
            ..
        } => {
            for buildset in runtime.buildsets.values_mut() {
                let has_build = buildset.builds.values().any(|b| b.id == *build);
                if has_build {
                    if let Some(b) = buildset.builds.values_mut().find(|b| b.id == *build) {
                        if !b.is_complete() {
                            b.complete(*result, *end_time);
                        }
                    }
                    for w in warnings {
                        if !buildset.warnings.contains(w) {
                            buildset.warnings.push(w.clone());
                        }
                    }
                }
            }
        }
        ResultEvent::MergeCompleted {
            item,
            merged,
            commit,
            files,
        } => {
            if let Some(queue_item) = runtime.items.get(item) {
                if let Some(bs) = queue_item.current_buildset.and_then(|id| runtime.buildsets.get_mut(&id)) {
                    bs.merge_state = zuul_pipeline_state::MergeState::Complete;
                    bs.merged_commit = commit.clone();
                    bs.files = files.clone();
                    bs.unable_to_merge = !merged;
                }
            }
        }
        ResultEvent::NodesProvisioned { .. } => {
            // Node acceptance/use bookkeeping happens inside the manager's
            // own provisioning pass, which re-polls request state directly
            // from the nodepool service rather than trusting this event's
            // contents (spec §4.D).
        }
    }
}

/// Turns every trigger event a pipeline's own queue has accumulated into an
/// `addChange` call (spec §4.H `addChange`, §4.I "process trigger events").
/// Matching against `event_matches` already happened during tenant fan-out
/// (`fan_out_trigger_events`), so every event here is already known to
/// belong to this pipeline; all that's left is resolving the project's
/// frozen job graph out of the tenant's `Layout` and handing it to the
/// manager.
async fn apply_trigger_events(
    handle: &PipelineHandle,
    runtime: &mut PipelineRuntime,
    layout: &Layout,
    events: &[Event<TriggerEvent>],
) -> Result<(), SchedulerError> {
    for event in events {
        let trigger = &event.payload;
        let job_graph = resolve_job_graph(layout, handle.pipeline_name(), &trigger.project);
        if job_graph.is_empty() {
            debug!(
                project = %trigger.project, change = %trigger.change, pipeline = %handle.pipeline_name(),
                "no jobs configured for this project in this pipeline, not enqueuing"
            );
            continue;
        }
        let req = zuul_manager::AddChangeRequest::new(
            format!("{}:{}", trigger.project, trigger.change),
            true,
            job_graph,
        );
        handle.manager.add_change(runtime, req).await?;
    }
    Ok(())
}

/// Resolves a project's frozen job graph for one pipeline (spec §3 "frozen
/// job graph"; §4.H step 4 `prepareLayout`): the ordered job names
/// `layout.projects[project].pipeline_jobs[pipeline]` names, to be frozen
/// into the new item's buildset at enqueue time. A project the tenant's
/// layout doesn't know, or one with nothing configured for this pipeline,
/// resolves to an empty graph — callers treat that as "don't enqueue"
/// rather than enqueuing an item that would vacuously report success.
fn resolve_job_graph(layout: &Layout, pipeline: &str, project: &str) -> Vec<String> {
    layout
        .projects
        .get(project)
        .and_then(|p| p.pipeline_jobs.get(pipeline))
        .cloned()
        .unwrap_or_default()
}

/// Walks every queue a reconfigure parked under `old_queues/` and re-enqueues
/// its items into the freshly loaded `runtime`, then clears the old queue
/// out of the store (spec §4.G, §4.I "reenqueue old queues if present";
/// seed scenario 6). Item ordering is preserved exactly as the old queue had
/// it; each item's buildset keeps builds for jobs that still exist in the
/// new `Layout` and has builds for removed jobs canceled, then has its
/// `job_graph` re-frozen to the new job set.
///
/// Items and buildsets are not duplicated by this: a `QueueItem`/`BuildSet`
/// lives at `items/<uuid>` independent of which queue references it, so
/// `move_to_old_queues` only ever moves the ordering metadata aside — the
/// items it names are still loadable from the store.
async fn reenqueue_old_queues(
    handle: &PipelineHandle,
    runtime: &mut PipelineRuntime,
    layout: &Layout,
) -> Result<(), SchedulerError> {
    let old_queues = handle.store.all_old_queues().await?;
    if old_queues.is_empty() {
        return Ok(());
    }
    let pipeline_name = handle.pipeline_name().to_string();

    for old_queue in old_queues {
        let mut new_queue = ChangeQueue::new(old_queue.id.clone(), pipeline_name.clone(), old_queue.window);
        new_queue.dynamic = old_queue.dynamic;
        new_queue.project_branches = old_queue.project_branches.clone();

        let mut previous: Option<ItemId> = None;
        for item_id in &old_queue.queue {
            if runtime.items.contains_key(item_id) {
                continue;
            }
            let Some(mut item) = handle.store.load_item(*item_id).await? else {
                // The item was already finalized and its node deleted
                // between the reconfigure and this pass; skip the gap.
                continue;
            };

            let project = item
                .change
                .split_once(':')
                .map(|(p, _)| p.to_string())
                .unwrap_or_else(|| item.change.clone());
            let fresh_job_graph = resolve_job_graph(layout, &pipeline_name, &project);

            if let Some(bs_id) = item.current_buildset {
                if let Some(mut bs) = handle.store.load_buildset(*item_id, bs_id).await? {
                    let removed_jobs: Vec<String> = bs
                        .builds
                        .keys()
                        .filter(|job| !fresh_job_graph.contains(job))
                        .cloned()
                        .collect();
                    for job in &removed_jobs {
                        if let Some(build) = bs.builds.get_mut(job) {
                            if !build.is_complete() {
                                build.cancel();
                            }
                        }
                    }
                    bs.job_graph = fresh_job_graph;
                    runtime.buildsets.insert(bs.id, bs);
                }
            }

            item.item_ahead = previous;
            item.items_behind.clear();
            if let Some(p) = previous {
                if let Some(prev_item) = runtime.items.get_mut(&p) {
                    prev_item.items_behind.push(*item_id);
                }
            }
            new_queue.queue.push(*item_id);
            previous = Some(*item_id);
            runtime.items.insert(*item_id, item);
        }

        if !new_queue.queue.is_empty() {
            runtime.queues.push(new_queue);
        }
        handle.store.clear_old_queue(&old_queue.id).await?;
    }

    Ok(())
}

async fn load_runtime(store: &PipelineStateStore) -> Result<PipelineRuntime, SchedulerError> {
    let mut runtime = PipelineRuntime::new();
    for queue_id in store.all_queue_ids().await? {
        let Some(queue) = store.load_queue(&queue_id).await? else {
            continue;
        };
        for item_id in queue.queue.clone() {
            if let Some(item) = store.load_item(item_id).await? {
                if let Some(bs_id) = item.current_buildset {
                    if let Some(bs) = store.load_buildset(item_id, bs_id).await? {
                        runtime.buildsets.insert(bs_id, bs);
                    }
                }
                runtime.items.insert(item_id, item);
            }
        }
        runtime.queues.push(queue);
    }
    Ok(runtime)
}

async fn persist_runtime(
    store: &PipelineStateStore,
    runtime: &PipelineRuntime,
    before_queue_ids: &BTreeSet<String>,
    before_item_ids: &HashSet<ItemId>,
) -> Result<(), SchedulerError> {
    let after_queue_ids: BTreeSet<String> = runtime.queues.iter().map(|q| q.id.clone()).collect();
    let after_item_ids: HashSet<ItemId> = runtime.items.keys().copied().collect();

    for queue in &runtime.queues {
        store.persist_queue(queue).await?;
    }
    for id in before_queue_ids.difference(&after_queue_ids) {
        store.delete_queue(id).await?;
    }

    for item in runtime.items.values() {
        store.persist_item(item).await?;
        if let Some(bs_id) = item.current_buildset {
            if let Some(bs) = runtime.buildsets.get(&bs_id) {
                store.persist_buildset(bs).await?;
            }
        }
    }
    for id in before_item_ids.difference(&after_item_ids) {
        store.delete_item(*id).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_layout::{ManagerKind, PipelineConfig, Precedence, ProjectConfig, ProjectTrust};
    use zuul_manager::{AlwaysMergeable, BaseManager, DependentManager, MemoryExecutorClient};
    use zuul_nodepool::NodeRequestService;
    use zuul_pipeline_state::{BuildSet, QueueItem};
    use zuul_reporting::ReportRegistry;
    use zuul_semaphore::SemaphoreHandler;
    use zuul_types::{Build, BuildResult, TenantName};
    use zuul_zk::MemoryCoordinationClient;

    fn window() -> zuul_duration::WindowPolicy {
        zuul_duration::WindowPolicy {
            initial: 20,
            floor: 3,
            increase_type: zuul_duration::WindowGrowthType::Linear,
            increase_factor: 5,
            decrease_type: zuul_duration::WindowGrowthType::Exponential,
            decrease_factor: 2,
        }
    }

    fn test_handle(client: Arc<dyn zuul_zk::CoordinationClient>) -> PipelineHandle {
        let config = PipelineConfig {
            name: "gate".to_string(),
            manager: ManagerKind::Dependent,
            triggers: vec![],
            reporters: vec![],
            window: window(),
            precedence: Precedence::Normal,
            queue_names: vec!["integrated".into()],
        };
        let base = BaseManager::new(
            "t1",
            Arc::new(MemoryExecutorClient::new()) as Arc<dyn zuul_manager::ExecutorClient>,
            Arc::new(SemaphoreHandler::new(client.clone(), TenantName::from("t1"))),
            Arc::new(NodeRequestService::new(client.clone())),
            Arc::new(ReportRegistry::new()),
            Arc::new(AlwaysMergeable) as Arc<dyn zuul_manager::MergeabilityOracle>,
        );
        let manager = Arc::new(DependentManager::new(base, config));
        PipelineHandle::new(client, "t1", manager)
    }

    fn layout_with_job(pipeline: &str, project: &str, jobs: Vec<&str>) -> Layout {
        let mut layout = Layout::new();
        let mut pipeline_jobs = std::collections::BTreeMap::new();
        pipeline_jobs.insert(
            pipeline.to_string(),
            jobs.into_iter().map(str::to_string).collect(),
        );
        layout.projects.insert(
            project.to_string(),
            ProjectConfig {
                name: project.to_string(),
                trust: ProjectTrust::Untrusted,
                pipeline_jobs,
            },
        );
        layout
    }

    #[tokio::test]
    async fn reenqueue_old_queues_is_a_no_op_with_nothing_parked() {
        let client: Arc<dyn zuul_zk::CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let handle = test_handle(client);
        handle.store.ensure_root().await.unwrap();
        let layout = layout_with_job("gate", "org/project", vec!["build"]);

        let mut runtime = PipelineRuntime::new();
        reenqueue_old_queues(&handle, &mut runtime, &layout).await.unwrap();
        assert!(runtime.queues.is_empty());
        assert!(runtime.items.is_empty());
    }

    #[tokio::test]
    async fn reenqueue_old_queues_preserves_order_and_refreezes_job_graph() {
        let client: Arc<dyn zuul_zk::CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let handle = test_handle(client);
        handle.store.ensure_root().await.unwrap();

        // Old layout had "build" and "lint"; reconfigure drops "lint" and
        // adds "test".
        let mut ahead = QueueItem::new("org/project:1", true);
        let mut behind = QueueItem::new("org/project:2", true);

        let mut ahead_bs = BuildSet::new(ahead.id, vec!["build".into(), "lint".into()]);
        let mut lint_build = Build::new("lint");
        lint_build.complete(BuildResult::Success, chrono::Utc::now());
        ahead_bs.builds.insert("lint".into(), lint_build);
        ahead.current_buildset = Some(ahead_bs.id);

        let behind_bs = BuildSet::new(behind.id, vec!["build".into(), "lint".into()]);
        behind.current_buildset = Some(behind_bs.id);

        ahead.items_behind.push(behind.id);
        behind.item_ahead = Some(ahead.id);

        handle.store.persist_item(&ahead).await.unwrap();
        handle.store.persist_item(&behind).await.unwrap();
        handle.store.persist_buildset(&ahead_bs).await.unwrap();
        handle.store.persist_buildset(&behind_bs).await.unwrap();

        let mut old_queue = zuul_pipeline_state::ChangeQueue::new("integrated", "gate", 20);
        old_queue.queue = vec![ahead.id, behind.id];
        handle.store.move_to_old_queues(&old_queue).await.unwrap();

        let layout = layout_with_job("gate", "org/project", vec!["build", "test"]);
        let mut runtime = PipelineRuntime::new();
        reenqueue_old_queues(&handle, &mut runtime, &layout).await.unwrap();

        assert_eq!(runtime.queues.len(), 1);
        let queue = &runtime.queues[0];
        assert_eq!(queue.queue, vec![ahead.id, behind.id]);

        let reloaded_ahead = &runtime.items[&ahead.id];
        assert!(reloaded_ahead.item_ahead.is_none());
        assert_eq!(reloaded_ahead.items_behind, vec![behind.id]);

        let reloaded_behind = &runtime.items[&behind.id];
        assert_eq!(reloaded_behind.item_ahead, Some(ahead.id));
        assert!(reloaded_behind.items_behind.is_empty());

        let reloaded_ahead_bs = &runtime.buildsets[&ahead_bs.id];
        assert_eq!(
            reloaded_ahead_bs.job_graph,
            vec!["build".to_string(), "test".to_string()]
        );
        // The completed "lint" build is kept even though "lint" is no
        // longer in the fresh job graph.
        assert!(reloaded_ahead_bs.builds["lint"].is_complete());

        assert!(handle.store.all_old_queues().await.unwrap().is_empty());
    }
}

