//! Per-tenant runtime state the main loop iterates over (spec §4.I): one
//! [`TenantRuntime`] per configured tenant, holding its parsed [`Tenant`],
//! its tenant-scoped management/trigger queues, and one [`PipelineHandle`]
//! per pipeline the tenant's layout configures.

use std::collections::BTreeMap;
use std::sync::Arc;

use zuul_events::{ManagementEventQueue, ResultEventQueue, TriggerEventQueue};
use zuul_layout::{ManagerKind, PipelineConfig, Tenant, UnparsedTenantConfig};
use zuul_layout::store::LayoutState;
use zuul_manager::{
    BaseManager, DependentManager, ExecutorClient, IndependentManager, MergeabilityOracle,
    PipelineManager, SerialManager, SupercedentManager,
};
use zuul_nodepool::NodeRequestService;
use zuul_pipeline_state::PipelineStateStore;
use zuul_reporting::ReportRegistry;
use zuul_semaphore::SemaphoreHandler;
use zuul_zk::CoordinationClient;

/// Builds the right [`PipelineManager`] impl for `config.manager`, each
/// wrapping a freshly constructed [`BaseManager`] sharing this tenant's
/// executor/semaphore/nodepool/reporter/mergeability services — spec §4.H
/// lists the four manager kinds as differing only in queue resolution and
/// failure cascade, which is exactly what the four thin wrapper structs
/// encode over one shared `BaseManager`.
#[allow(clippy::too_many_arguments)]
pub fn build_manager(
    config: &PipelineConfig,
    tenant: &str,
    executor: Arc<dyn ExecutorClient>,
    semaphores: Arc<SemaphoreHandler>,
    nodepool: Arc<NodeRequestService>,
    reporters: Arc<ReportRegistry>,
    mergeability: Arc<dyn MergeabilityOracle>,
) -> Arc<dyn PipelineManager> {
    let base = BaseManager::new(tenant, executor, semaphores, nodepool, reporters, mergeability);
    match config.manager {
        ManagerKind::Dependent => Arc::new(DependentManager::new(base, config.clone())),
        ManagerKind::Independent => Arc::new(IndependentManager::new(base, config.clone())),
        ManagerKind::Serial => Arc::new(SerialManager::new(base, config.clone())),
        ManagerKind::Supercedent => Arc::new(SupercedentManager::new(base, config.clone())),
    }
}

/// One configured pipeline's manager plus the coordination-store handles the
/// main loop drains and persists through on every pass.
pub struct PipelineHandle {
    pub manager: Arc<dyn PipelineManager>,
    pub store: PipelineStateStore,
    /// Per-pipeline trigger queue: the tenant's fan-out step (spec §4.I
    /// "forward into each matching pipeline's trigger queue") copies a
    /// matching event here rather than every pipeline re-scanning the
    /// tenant-wide queue and re-deciding `event_matches` against events
    /// other pipelines already claimed.
    pub trigger_queue: TriggerEventQueue,
    pub result_queue: ResultEventQueue,
}

impl PipelineHandle {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        tenant: &str,
        manager: Arc<dyn PipelineManager>,
    ) -> Self {
        let pipeline = manager.config().name.clone();
        Self {
            store: PipelineStateStore::new(client.clone(), tenant, &pipeline),
            trigger_queue: TriggerEventQueue::new(
                client.clone(),
                format!("/events/trigger/{tenant}/{pipeline}"),
            ),
            result_queue: ResultEventQueue::new(client, format!("/events/result/{tenant}/{pipeline}")),
            manager,
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.manager.config().name
    }
}

/// Everything the main loop needs for one tenant: its resolved [`Tenant`],
/// the raw [`UnparsedTenantConfig`] a reconfigure re-folds into a new
/// `Layout`, the local layout cache it compares against the coordination
/// store's copy (spec §4.F), and every pipeline it currently runs.
pub struct TenantRuntime {
    pub name: String,
    pub tenant: Tenant,
    pub unparsed: UnparsedTenantConfig,
    pub local_layout_state: Option<LayoutState>,
    pub pipelines: BTreeMap<String, PipelineHandle>,
    pub management_queue: ManagementEventQueue,
    pub trigger_queue: TriggerEventQueue,
}

impl TenantRuntime {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        name: impl Into<String>,
        tenant: Tenant,
        unparsed: UnparsedTenantConfig,
    ) -> Self {
        let name = name.into();
        Self {
            management_queue: ManagementEventQueue::new(client.clone(), format!("/events/management/{name}")),
            trigger_queue: TriggerEventQueue::new(client, format!("/events/trigger/{name}")),
            name,
            tenant,
            unparsed,
            local_layout_state: None,
            pipelines: BTreeMap::new(),
        }
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineHandle> {
        self.pipelines.get(name)
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }
}
