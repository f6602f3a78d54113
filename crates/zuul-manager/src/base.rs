//! Shared machinery every [`crate::PipelineManager`] variant embeds: the
//! readiness/dependency gate in `add_change`, the NNFI-reparenting +
//! window-aware `process_queue` loop, and reporter/window bookkeeping
//! (spec §4.H). The four variant structs differ only in how they resolve
//! which [`ChangeQueue`] a change lands in and whether failures cascade past
//! the dependent case — everything else here is identical for all of them.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use zuul_layout::{Layout, PipelineConfig, ReportOutcome};
use zuul_nodepool::{NodeRequestHandle, NodeRequestService, NodepoolError};
use zuul_pipeline_state::{BuildSet, ChangeQueue, QueueItem};
use zuul_reporting::{ReportContext, ReportRegistry};
use zuul_semaphore::{AcquirePhase, SemaphoreHandler};
use zuul_types::{Build, ItemId, NodeRequest, SemaphoreHandle, TriggerEvent};

use crate::error::ManagerError;
use crate::executor::ExecutorClient;
use crate::mergeability::MergeabilityOracle;
use crate::runtime::{AddChangeRequest, PipelineRuntime};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Supplies the cross-repo dependency graph a change declares and the
/// changes waiting behind it (spec §1: sourced from the external source
/// system's commit-message/API dependency data, not reimplemented here).
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, change: &str) -> Option<AddChangeRequest>;
    fn dependents_of(&self, _change: &str) -> Vec<String> {
        Vec::new()
    }
}

/// No cross-repo dependencies: every `add_change` is taken at face value.
pub struct NullResolver;

impl DependencyResolver for NullResolver {
    fn resolve(&self, _change: &str) -> Option<AddChangeRequest> {
        None
    }
}

pub struct BaseManager {
    pub tenant: String,
    pub executor: Arc<dyn ExecutorClient>,
    pub semaphores: Arc<SemaphoreHandler>,
    pub nodepool: Arc<NodeRequestService>,
    pub reporters: Arc<ReportRegistry>,
    pub mergeability: Arc<dyn MergeabilityOracle>,
    pub resolver: Arc<dyn DependencyResolver>,
    /// `(item, job) -> outstanding node request`, kept only for the
    /// lifetime of this manager's process — a restart relies on the node
    /// service's own session-loss resubmission (spec §4.D), not on this
    /// surviving a crash.
    pending_requests: Mutex<HashMap<(ItemId, String), NodeRequestHandle>>,
}

impl BaseManager {
    pub fn new(
        tenant: impl Into<String>,
        executor: Arc<dyn ExecutorClient>,
        semaphores: Arc<SemaphoreHandler>,
        nodepool: Arc<NodeRequestService>,
        reporters: Arc<ReportRegistry>,
        mergeability: Arc<dyn MergeabilityOracle>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            executor,
            semaphores,
            nodepool,
            reporters,
            mergeability,
            resolver: Arc::new(NullResolver),
            pending_requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Whether `event` is one this pipeline cares about (spec §4.H
    /// `eventMatches`): the trigger name must match one of the pipeline's
    /// filters, and if that filter names ref patterns, the event's branch or
    /// change must match one of them (`"*"` matches anything).
    pub fn event_matches(cfg: &PipelineConfig, event: &TriggerEvent) -> bool {
        cfg.triggers.iter().any(|filter| {
            filter.trigger_name == event.trigger_name
                && (filter.ref_filters.is_empty()
                    || filter.ref_filters.iter().any(|pat| {
                        pat == "*"
                            || event.branch.as_deref() == Some(pat.as_str())
                            || event.change == *pat
                    }))
        })
    }

    fn ensure_queue(runtime: &mut PipelineRuntime, queue_id: &str, pipeline: &str, initial_window: u32) {
        if runtime.queue(queue_id).is_none() {
            let mut q = ChangeQueue::new(queue_id, pipeline, initial_window);
            q.dynamic = true;
            runtime.queues.push(q);
        }
    }

    async fn dispatch_report(
        &self,
        pipeline: &str,
        item: &QueueItem,
        cfg: &PipelineConfig,
        outcome: ReportOutcome,
        message: impl Into<String>,
    ) {
        let names: Vec<String> = cfg.reporters_for(outcome).map(String::from).collect();
        if names.is_empty() {
            return;
        }
        let ctx = ReportContext {
            tenant: self.tenant.clone(),
            pipeline: pipeline.to_string(),
            item: item.id,
            change: item.change.clone(),
            outcome,
            message: message.into(),
        };
        let errors = self.reporters.dispatch(&names, &ctx).await;
        for e in errors {
            warn!(item = %item.id, error = %e, "reporter failed");
        }
    }

    /// Enqueues one change, recursively pulling in unresolved changes it
    /// depends on ahead of it, then any changes already waiting behind it
    /// (spec §4.H `addChange`, 6-step algorithm). Boxed because it recurses
    /// across `.await` points.
    pub fn add_change<'a>(
        &'a self,
        runtime: &'a mut PipelineRuntime,
        cfg: &'a PipelineConfig,
        queue_id: String,
        req: AddChangeRequest,
        history: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<bool, ManagerError>> {
        Box::pin(async move {
            if req.live && runtime.find_live_item(&req.change).is_some() {
                return Ok(false);
            }
            if !req.ignore_requirements && !self.mergeability.is_mergeable(&req.change) {
                return Ok(false);
            }
            if history.contains(&req.change) {
                return Err(ManagerError::DependencyCycle(req.change.clone()));
            }

            Self::ensure_queue(runtime, &queue_id, &cfg.name, cfg.window.initial);
            history.insert(req.change.clone());

            let mut last_dep_item = None;
            for dep in req.dependencies.clone() {
                let dep_item = match runtime.items.values().find(|i| i.change == dep) {
                    Some(item) => item.id,
                    None => {
                        let Some(dep_req) = self.resolver.resolve(&dep) else {
                            // Unresolvable dependency: this change cannot be
                            // proven mergeable yet, so don't enqueue it.
                            history.remove(&req.change);
                            return Ok(false);
                        };
                        if !self
                            .add_change(runtime, cfg, queue_id.clone(), dep_req, history)
                            .await?
                        {
                            history.remove(&req.change);
                            return Ok(false);
                        }
                        runtime
                            .items
                            .values()
                            .find(|i| i.change == dep)
                            .map(|i| i.id)
                            .expect("add_change just enqueued this change")
                    }
                };

                match runtime.queue_for_item(dep_item) {
                    Some(q) if q.id == queue_id => last_dep_item = Some(dep_item),
                    Some(_) => {
                        return Err(ManagerError::CrossQueueDependency(req.change.clone(), dep))
                    }
                    None => last_dep_item = Some(dep_item),
                }
            }

            let after = last_dep_item.or_else(|| runtime.queue(&queue_id).and_then(|q| q.queue.last().copied()));

            let mut item = QueueItem::new(req.change.clone(), req.live);
            item.item_ahead = after;
            let item_id = item.id;

            if let Some(ahead) = after {
                if let Some(ahead_item) = runtime.items.get_mut(&ahead) {
                    ahead_item.items_behind.push(item_id);
                }
            }

            let buildset = BuildSet::new(item_id, req.job_graph.clone());
            item.current_buildset = Some(buildset.id);
            runtime.buildsets.insert(buildset.id, buildset);
            runtime.items.insert(item_id, item);

            if let Some(q) = runtime.queue_mut(&queue_id) {
                q.insert_after(item_id, after);
            }

            let item_ref = runtime.items.get(&item_id).expect("just inserted").clone();
            self.dispatch_report(&cfg.name, &item_ref, cfg, ReportOutcome::Start, "start")
                .await;

            for dependent in self.resolver.dependents_of(&req.change) {
                if runtime.find_live_item(&dependent).is_some() {
                    continue;
                }
                if let Some(dependent_req) = self.resolver.resolve(&dependent) {
                    self.add_change(runtime, cfg, queue_id.clone(), dependent_req, history)
                        .await?;
                }
            }

            history.remove(&req.change);
            Ok(true)
        })
    }

    /// Removes `item` from whichever queue holds it, releasing any
    /// semaphores and canceling any outstanding node request its current
    /// buildset holds (spec §4.H `removeItem`). Idempotent.
    pub async fn remove_item(
        &self,
        runtime: &mut PipelineRuntime,
        layout: &Layout,
        item_id: ItemId,
    ) -> Result<(), ManagerError> {
        if !runtime.items.contains_key(&item_id) {
            return Ok(());
        }
        self.finalize_item(runtime, layout, item_id).await
    }

    async fn finalize_item(
        &self,
        runtime: &mut PipelineRuntime,
        layout: &Layout,
        item_id: ItemId,
    ) -> Result<(), ManagerError> {
        if let Some(bs_id) = runtime.items.get(&item_id).and_then(|i| i.current_buildset) {
            let job_graph = runtime
                .buildsets
                .get(&bs_id)
                .map(|b| b.job_graph.clone())
                .unwrap_or_default();
            for job_name in job_graph {
                if let Some(variant) = layout.resolve_job(&job_name) {
                    for sem_name in &variant.semaphores {
                        let handle = SemaphoreHandle {
                            item: item_id,
                            job_name: job_name.clone(),
                        };
                        self.semaphores.release(sem_name, &handle).await?;
                    }
                }
                if let Some(handle) = self
                    .pending_requests
                    .lock()
                    .unwrap()
                    .remove(&(item_id, job_name.clone()))
                {
                    self.nodepool.cancel(&handle).await?;
                }
            }
        }

        let (ahead, behind) = runtime
            .items
            .get(&item_id)
            .map(|i| (i.item_ahead, i.items_behind.clone()))
            .unwrap_or((None, Vec::new()));

        if let Some(a) = ahead {
            if let Some(ai) = runtime.items.get_mut(&a) {
                ai.items_behind.retain(|i| *i != item_id);
                ai.items_behind.extend(behind.iter().copied());
            }
        }
        for b in &behind {
            if let Some(bi) = runtime.items.get_mut(b) {
                bi.item_ahead = ahead;
            }
        }

        runtime.remove_item(item_id);
        Ok(())
    }

    /// Moves `queue_id` to the front of the pipeline's queue list, so it's
    /// processed (and given window priority) ahead of its siblings
    /// (spec §4.H `promoteQueue`, glossary "Promote").
    pub fn promote_queue(queues: &mut [ChangeQueue], queue_id: &str) {
        if let Some(idx) = queues.iter().position(|q| q.id == queue_id) {
            queues[..=idx].rotate_right(1);
        }
    }

    /// Splices an item with no builds and no node requests out of its queue
    /// without needing a `Layout` — used by
    /// [`crate::supercedent::SupercedentManager`] to drop a stale item
    /// before it's ever actionable, which never acquired anything there is
    /// to release.
    pub fn remove_unstarted_item(runtime: &mut PipelineRuntime, item_id: ItemId) {
        let (ahead, behind) = runtime
            .items
            .get(&item_id)
            .map(|i| (i.item_ahead, i.items_behind.clone()))
            .unwrap_or((None, Vec::new()));

        if let Some(a) = ahead {
            if let Some(ai) = runtime.items.get_mut(&a) {
                ai.items_behind.retain(|i| *i != item_id);
                ai.items_behind.extend(behind.iter().copied());
            }
        }
        for b in &behind {
            if let Some(bi) = runtime.items.get_mut(b) {
                bi.item_ahead = ahead;
            }
        }

        runtime.remove_item(item_id);
    }

    async fn advance_jobs(
        &self,
        runtime: &mut PipelineRuntime,
        layout: &Layout,
        item_id: ItemId,
    ) -> Result<(), ManagerError> {
        let Some(bs_id) = runtime.items.get(&item_id).and_then(|i| i.current_buildset) else {
            return Ok(());
        };
        let job_graph = runtime
            .buildsets
            .get(&bs_id)
            .map(|b| b.job_graph.clone())
            .unwrap_or_default();

        for job_name in &job_graph {
            let Some(variant) = layout.resolve_job(job_name) else {
                continue;
            };

            let requestable = runtime
                .buildsets
                .get(&bs_id)
                .map(|b| b.is_requestable(job_name))
                .unwrap_or(false);

            if requestable {
                let mut all_acquired = true;
                for sem_name in &variant.semaphores {
                    if let Some(sem_cfg) = layout.semaphores.get(sem_name) {
                        let handle = SemaphoreHandle {
                            item: item_id,
                            job_name: job_name.clone(),
                        };
                        let acquired = self
                            .semaphores
                            .acquire(
                                sem_name,
                                sem_cfg.max_count,
                                sem_cfg.resources_first,
                                AcquirePhase::NodeRequest,
                                handle,
                            )
                            .await?;
                        if !acquired {
                            all_acquired = false;
                            break;
                        }
                    }
                }
                if !all_acquired {
                    continue;
                }

                let labels = variant
                    .nodeset
                    .as_deref()
                    .and_then(|name| layout.nodesets.get(name))
                    .map(|ns| ns.labels.clone())
                    .unwrap_or_default();
                let request = NodeRequest::new(labels, 100, "zuul-scheduler");
                let handle = self.nodepool.request(request).await?;
                if let Some(id) = handle.request.id {
                    if let Some(bs) = runtime.buildsets.get_mut(&bs_id) {
                        bs.node_requests.insert(job_name.clone(), id);
                    }
                }
                self.pending_requests
                    .lock()
                    .unwrap()
                    .insert((item_id, job_name.clone()), handle);
                continue;
            }

            let launchable = runtime
                .buildsets
                .get(&bs_id)
                .map(|b| b.is_launchable(job_name, &variant.dependencies))
                .unwrap_or(false);
            if !launchable {
                continue;
            }

            let handle = self
                .pending_requests
                .lock()
                .unwrap()
                .get(&(item_id, job_name.clone()))
                .cloned();
            let Some(handle) = handle else { continue };

            match self.nodepool.accept(&handle).await {
                Ok(Ok(nodeset)) => {
                    for sem_name in &variant.semaphores {
                        if let Some(sem_cfg) = layout.semaphores.get(sem_name) {
                            let sem_handle = SemaphoreHandle {
                                item: item_id,
                                job_name: job_name.clone(),
                            };
                            self.semaphores
                                .acquire(
                                    sem_name,
                                    sem_cfg.max_count,
                                    sem_cfg.resources_first,
                                    AcquirePhase::Launch,
                                    sem_handle,
                                )
                                .await?;
                        }
                    }
                    let build_id = self.executor.submit_build(item_id, job_name, &nodeset).await;
                    if let Some(bs) = runtime.buildsets.get_mut(&bs_id) {
                        let mut build = Build::new(job_name.clone());
                        build.id = build_id;
                        bs.bump_try(job_name);
                        bs.builds.insert(job_name.clone(), build);
                    }
                    self.pending_requests.lock().unwrap().remove(&(item_id, job_name.clone()));
                }
                Ok(Err(resubmitted)) => {
                    self.pending_requests
                        .lock()
                        .unwrap()
                        .insert((item_id, job_name.clone()), resubmitted);
                }
                Err(NodepoolError::NotReady(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// One sweep of `queue_id`: NNFI reparenting, failing-dependency
    /// propagation, job advancement within the window, and dequeue-on-
    /// completion (spec §4.H `processQueue`/`processOneItem`, 8-step
    /// algorithm). `cascade_failure` is `true` for the dependent manager,
    /// where a head's merge failure immediately fails everything behind it;
    /// the other three managers don't order items with that dependency, so
    /// they never set it. Returns whether anything in the queue changed.
    pub async fn process_queue(
        &self,
        runtime: &mut PipelineRuntime,
        cfg: &PipelineConfig,
        layout: &Layout,
        queue_id: &str,
        cascade_failure: bool,
    ) -> Result<bool, ManagerError> {
        let Some(order) = runtime.queue(queue_id).map(|q| q.queue.clone()) else {
            return Ok(false);
        };
        let actionable: HashSet<ItemId> = runtime
            .queue(queue_id)
            .map(|q| q.actionable().collect())
            .unwrap_or_default();

        let mut nnfi: Option<ItemId> = None;
        let mut changed = false;

        for item_id in order {
            if !runtime.items.contains_key(&item_id) {
                continue;
            }

            let current_ahead = runtime.items[&item_id].item_ahead;
            if current_ahead != nnfi {
                changed = true;
                if let Some(q) = runtime.queue_mut(queue_id) {
                    q.remove(item_id);
                    q.insert_after(item_id, nnfi);
                }
                if let Some(old_ahead) = current_ahead {
                    if let Some(old) = runtime.items.get_mut(&old_ahead) {
                        old.items_behind.retain(|i| *i != item_id);
                    }
                }
                if let Some(new_ahead) = nnfi {
                    if let Some(new) = runtime.items.get_mut(&new_ahead) {
                        new.items_behind.push(item_id);
                    }
                }
                if let Some(item) = runtime.items.get_mut(&item_id) {
                    item.item_ahead = nnfi;
                    // A reset buildset starts over from scratch, so any
                    // earlier failing verdict no longer applies — otherwise
                    // `advance_jobs`'s `!failing` gate (below) would strand
                    // this item forever even though it just got a clean
                    // buildset to retry against the new nnfi.
                    item.failing = false;
                }
                if let Some(bs) = runtime.buildset_for_mut(item_id) {
                    bs.cancel_all(true);
                }
            }

            let ahead_failing = nnfi
                .map(|a| runtime.items.get(&a).map(|i| i.failing).unwrap_or(false))
                .unwrap_or(false);
            if ahead_failing {
                if let Some(item) = runtime.items.get_mut(&item_id) {
                    if !item.failing {
                        item.failing = true;
                        changed = true;
                    }
                }
                if let Some(bs) = runtime.buildset_for_mut(item_id) {
                    bs.cancel_all(false);
                }
            }

            if actionable.contains(&item_id) && !runtime.items[&item_id].failing {
                self.advance_jobs(runtime, layout, item_id).await?;
            }

            let own_failed = runtime.buildset_for(item_id).map(|bs| bs.any_job_failed()).unwrap_or(false);
            if own_failed {
                if let Some(item) = runtime.items.get_mut(&item_id) {
                    if !item.failing {
                        item.failing = true;
                        changed = true;
                    }
                }
            }

            let is_live = runtime.items.get(&item_id).map(|i| i.live).unwrap_or(false);
            let has_behind = runtime.items.get(&item_id).map(|i| !i.items_behind.is_empty()).unwrap_or(false);

            if !is_live && !has_behind {
                self.finalize_item(runtime, layout, item_id).await?;
                changed = true;
                continue;
            }

            // Only the head of the queue may report/dequeue on completion
            // (spec §4.H step 7): an item behind still has to wait for
            // everything ahead of it to merge first even if its own jobs
            // finished sooner, since the repository commits must land in
            // queue order.
            let is_head = runtime.items.get(&item_id).map(|i| i.is_head()).unwrap_or(false);
            let complete = is_head
                && is_live
                && runtime.buildset_for(item_id).map(|bs| bs.all_jobs_complete()).unwrap_or(false);
            if complete {
                let (merged_ok, unable_to_merge) = runtime
                    .buildset_for(item_id)
                    .map(|bs| (!bs.any_job_failed() && !bs.unable_to_merge, bs.unable_to_merge))
                    .unwrap_or((false, false));

                let outcome = if merged_ok {
                    ReportOutcome::Success
                } else if unable_to_merge {
                    ReportOutcome::MergeFailure
                } else {
                    ReportOutcome::Failure
                };
                let message = if merged_ok {
                    "all jobs succeeded"
                } else if unable_to_merge {
                    "unable to merge"
                } else {
                    "one or more jobs failed"
                };

                let item_ref = runtime.items.get(&item_id).cloned();
                if let Some(item_ref) = &item_ref {
                    self.dispatch_report(&cfg.name, item_ref, cfg, outcome, message).await;
                }

                if let Some(q) = runtime.queue_mut(queue_id) {
                    q.window = if merged_ok {
                        cfg.window.grow(q.window)
                    } else {
                        cfg.window.shrink(q.window)
                    };
                }

                // Only a merge failure cancels items behind (spec §4.H step
                // 7: "if reporting indicates a merge failure, cancel items
                // behind"). An ordinary job failure at the head doesn't
                // cascade here: `finalize_item` below already relinks the
                // next item in as the new head, which is free to launch
                // its own jobs without being marked failing.
                if cascade_failure && unable_to_merge && runtime.items[&item_id].item_ahead.is_none() {
                    let behind = runtime.items[&item_id].items_behind.clone();
                    for b in behind {
                        if let Some(bs) = runtime.buildset_for_mut(b) {
                            bs.cancel_all(false);
                        }
                        if let Some(behind_item) = runtime.items.get_mut(&b) {
                            behind_item.failing = true;
                        }
                    }
                }

                info!(item = %item_id, pipeline = %cfg.name, outcome = ?outcome, "item reported, dequeuing");
                self.finalize_item(runtime, layout, item_id).await?;
                changed = true;
                continue;
            }

            if is_live && !runtime.items[&item_id].failing {
                nnfi = Some(item_id);
            }
        }

        Ok(changed)
    }
}
