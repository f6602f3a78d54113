//! The Pipeline Manager (spec §4.H): the state machine that decides which
//! [`ChangeQueue`](zuul_pipeline_state::ChangeQueue) a change lands in,
//! reparents items behind the Nearest-Non-Failing-Item as the queue's head
//! changes, and walks each queue's actionable window provisioning nodes and
//! launching jobs.
//!
//! Manager variants are modeled as one trait, [`PipelineManager`], with four
//! implementing structs that each embed a shared [`base::BaseManager`] for
//! the operations common to all four — readiness checks, reporter dispatch,
//! and window bookkeeping — and differ only in queue resolution and whether
//! a head's failure cascades to everything behind it.

pub mod base;
pub mod dependent;
pub mod error;
pub mod executor;
pub mod independent;
pub mod mergeability;
pub mod runtime;
pub mod serial;
pub mod supercedent;

pub use base::{BaseManager, DependencyResolver, NullResolver};
pub use dependent::DependentManager;
pub use error::ManagerError;
pub use executor::{ExecutorClient, MemoryExecutorClient};
pub use independent::IndependentManager;
pub use mergeability::{AlwaysMergeable, DenyList, MergeabilityOracle};
pub use runtime::{AddChangeRequest, PipelineRuntime};
pub use serial::SerialManager;
pub use supercedent::SupercedentManager;

use async_trait::async_trait;
use zuul_layout::{Layout, PipelineConfig};
use zuul_types::{ItemId, TriggerEvent};

/// One pipeline's manager: the thing a scheduler's main loop calls into for
/// every trigger event, management command, and periodic processing pass
/// (spec §4.H, §4.I).
#[async_trait]
pub trait PipelineManager: Send + Sync {
    fn config(&self) -> &PipelineConfig;

    /// Whether a trigger event is one this pipeline acts on at all, before
    /// spending any work resolving it into an `AddChangeRequest`.
    fn event_matches(&self, event: &TriggerEvent) -> bool;

    /// Enqueues a change, returning whether it was actually enqueued (as
    /// opposed to rejected for not being live-duplicate-free, not mergeable,
    /// or not yet resolvable) — spec §4.H `addChange`.
    async fn add_change(&self, runtime: &mut PipelineRuntime, req: AddChangeRequest) -> Result<bool, ManagerError>;

    /// Forcibly dequeues an item, e.g. in response to a `Dequeue`
    /// management event — spec §4.H `removeItem`.
    async fn remove_item(
        &self,
        runtime: &mut PipelineRuntime,
        layout: &Layout,
        item: ItemId,
    ) -> Result<(), ManagerError>;

    /// Gives `queue_id` processing priority over its siblings — spec §4.H
    /// `promoteQueue`.
    fn promote_queue(&self, runtime: &mut PipelineRuntime, queue_id: &str);

    /// One sweep of every queue this manager owns: NNFI reparenting,
    /// failing-dependency propagation, job advancement, and dequeue on
    /// completion — spec §4.H `processQueue`. Returns whether anything
    /// changed, so a scheduler knows whether to persist and loop again.
    async fn process_queue(&self, runtime: &mut PipelineRuntime, layout: &Layout) -> Result<bool, ManagerError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use zuul_duration::{WindowGrowthType, WindowPolicy};
    use zuul_layout::{ManagerKind, Precedence, TriggerFilter};
    use zuul_zk::{CoordinationClient, MemoryCoordinationClient};

    use super::*;
    use crate::base::BaseManager;
    use crate::executor::MemoryExecutorClient;
    use crate::mergeability::AlwaysMergeable;

    fn window() -> WindowPolicy {
        WindowPolicy {
            initial: 20,
            floor: 2,
            increase_type: WindowGrowthType::Linear,
            increase_factor: 5,
            decrease_type: WindowGrowthType::Exponential,
            decrease_factor: 2,
        }
    }

    fn pipeline_config(name: &str, manager: ManagerKind) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            manager,
            triggers: vec![TriggerFilter {
                trigger_name: "patchset-created".into(),
                ref_filters: vec!["*".into()],
            }],
            reporters: vec![],
            window: window(),
            precedence: Precedence::Normal,
            queue_names: vec!["integrated".into()],
        }
    }

    fn test_base() -> BaseManager {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let tenant = zuul_types::TenantName::from("t1");
        BaseManager::new(
            "t1",
            Arc::new(MemoryExecutorClient::new()),
            Arc::new(zuul_semaphore::SemaphoreHandler::new(client.clone(), tenant)),
            Arc::new(zuul_nodepool::NodeRequestService::new(client)),
            Arc::new(zuul_reporting::ReportRegistry::new()),
            Arc::new(AlwaysMergeable),
        )
    }

    #[tokio::test]
    async fn dependent_manager_enqueues_one_change_behind_the_other() {
        let cfg = pipeline_config("gate", ManagerKind::Dependent);
        let mgr = DependentManager::new(test_base(), cfg);
        let mut runtime = PipelineRuntime::new();

        let a = AddChangeRequest::new("1,1", true, vec!["check-job".into()]);
        let b = AddChangeRequest::new("2,1", true, vec!["check-job".into()]);
        assert!(mgr.add_change(&mut runtime, a).await.unwrap());
        assert!(mgr.add_change(&mut runtime, b).await.unwrap());

        let queue = runtime.queue("integrated").expect("queue created");
        assert_eq!(queue.queue.len(), 2);
        let head = queue.queue[0];
        let tail = queue.queue[1];
        assert!(runtime.items[&head].item_ahead.is_none());
        assert_eq!(runtime.items[&tail].item_ahead, Some(head));
        assert_eq!(runtime.items[&head].items_behind, vec![tail]);
    }

    #[tokio::test]
    async fn dependent_manager_refuses_duplicate_live_enqueue() {
        let cfg = pipeline_config("gate", ManagerKind::Dependent);
        let mgr = DependentManager::new(test_base(), cfg);
        let mut runtime = PipelineRuntime::new();

        let req = AddChangeRequest::new("1,1", true, vec!["check-job".into()]);
        assert!(mgr.add_change(&mut runtime, req.clone()).await.unwrap());
        assert!(!mgr.add_change(&mut runtime, req).await.unwrap());
    }

    #[tokio::test]
    async fn nnfi_reparents_item_behind_the_nearest_non_failing_item() {
        let cfg = pipeline_config("gate", ManagerKind::Dependent);
        let mgr = DependentManager::new(test_base(), cfg.clone());
        let mut runtime = PipelineRuntime::new();

        for change in ["1,1", "2,1", "3,1", "4,1"] {
            let req = AddChangeRequest::new(change, true, vec!["noop".into()]);
            assert!(mgr.add_change(&mut runtime, req).await.unwrap());
        }

        let order = runtime.queue("integrated").unwrap().queue.clone();
        let (first, second, third, _fourth) = (order[0], order[1], order[2], order[3]);

        // Second item's own job fails. It must never become the
        // nearest-non-failing-item, so third (currently parented on it)
        // has to reparent behind first on the next pass.
        let bs_id = runtime.items[&second].current_buildset.unwrap();
        let bs = runtime.buildsets.get_mut(&bs_id).unwrap();
        let mut build = zuul_types::Build::new("noop");
        build.complete(zuul_types::BuildResult::Failure, chrono::Utc::now());
        bs.builds.insert("noop".into(), build);

        let layout = Layout::new();
        mgr.process_queue(&mut runtime, &layout).await.unwrap();

        assert!(runtime.items[&second].failing);
        assert_eq!(runtime.items[&third].item_ahead, Some(first));
        assert!(runtime.items[&first].items_behind.contains(&third));
        assert!(!runtime.items[&second].items_behind.contains(&third));
    }

    #[tokio::test]
    async fn supercedent_manager_replaces_an_unstarted_item_with_the_same_key() {
        let cfg = pipeline_config("periodic", ManagerKind::Supercedent);
        let mgr = SupercedentManager::new(test_base(), cfg);
        let mut runtime = PipelineRuntime::new();

        let mut first = AddChangeRequest::new("main@abc", true, vec!["build".into()]);
        first.supersede_key = Some("main".into());
        assert!(mgr.add_change(&mut runtime, first).await.unwrap());
        assert_eq!(runtime.items.len(), 1);

        let mut second = AddChangeRequest::new("main@def", true, vec!["build".into()]);
        second.supersede_key = Some("main".into());
        assert!(mgr.add_change(&mut runtime, second).await.unwrap());

        assert_eq!(runtime.items.len(), 1);
        let remaining = runtime.items.values().next().unwrap();
        assert_eq!(remaining.change, "main@def");
    }

    #[tokio::test]
    async fn independent_manager_gives_every_change_its_own_queue() {
        let cfg = pipeline_config("check", ManagerKind::Independent);
        let mgr = IndependentManager::new(test_base(), cfg);
        let mut runtime = PipelineRuntime::new();

        let a = AddChangeRequest::new("1,1", true, vec!["lint".into()]);
        let b = AddChangeRequest::new("2,1", true, vec!["lint".into()]);
        mgr.add_change(&mut runtime, a).await.unwrap();
        mgr.add_change(&mut runtime, b).await.unwrap();

        assert_eq!(runtime.queues.len(), 2);
        assert!(runtime.queues.iter().all(|q| q.queue.len() == 1));
    }

    #[tokio::test]
    async fn promote_queue_moves_the_named_queue_to_the_front() {
        let cfg = pipeline_config("check", ManagerKind::Independent);
        let mgr = IndependentManager::new(test_base(), cfg);
        let mut runtime = PipelineRuntime::new();

        for change in ["1,1", "2,1", "3,1"] {
            let req = AddChangeRequest::new(change, true, vec!["lint".into()]);
            mgr.add_change(&mut runtime, req).await.unwrap();
        }

        mgr.promote_queue(&mut runtime, "independent-3,1");
        assert_eq!(runtime.queues[0].id, "independent-3,1");
    }
}
