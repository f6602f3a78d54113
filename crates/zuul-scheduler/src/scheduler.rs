//! The scheduler process itself (spec §4.I): owns the coordination-store
//! client and every shared service (nodepool, semaphores, reporters,
//! mergeability), holds one [`TenantRuntime`] per configured tenant, and
//! drives the background tasks — main loop, cleanup, stats, layout watcher,
//! command socket — that together make up a running scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zuul_components::{ComponentHandle, ComponentRegistry};
use zuul_events::ManagementEventQueue;
use zuul_layout::store::LayoutStore;
use zuul_layout::{build_layout, Layout, Tenant, UnparsedTenantConfig};
use zuul_manager::{ExecutorClient, MergeabilityOracle};
use zuul_nodepool::NodeRequestService;
use zuul_reporting::ReportRegistry;
use zuul_semaphore::SemaphoreHandler;
use zuul_types::{ComponentKind, ComponentRegistration, TenantName};
use zuul_zk::CoordinationClient;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::loader::SharedTenantConfigLoader;
use crate::tenant::{build_manager, PipelineHandle, TenantRuntime};

pub struct Scheduler {
    pub client: Arc<dyn CoordinationClient>,
    pub config: SchedulerConfig,
    pub components: Arc<ComponentRegistry>,
    pub nodepool: Arc<NodeRequestService>,
    pub executor: Arc<dyn ExecutorClient>,
    pub mergeability: Arc<dyn MergeabilityOracle>,
    pub reporters: Arc<ReportRegistry>,
    pub layout_store: LayoutStore,
    pub tenants: RwLock<BTreeMap<String, TenantRuntime>>,
    /// Reconfigure-only commands the command socket issues directly, as
    /// opposed to the ones routed through a tenant's own management queue
    /// (spec §4.I "process global management event queue").
    global_management_queue: ManagementEventQueue,
    config_loader: SharedTenantConfigLoader,
    /// Woken by event producers (trigger/management enqueue, result report)
    /// and by the layout update thread so the main loop doesn't sit idle
    /// through its whole tick (spec §4.I, §4.L).
    pub wake: Notify,
    stop: AtomicBool,
    /// Toggled by the command socket's `repl`/`norepl` (spec §6); an actual
    /// interactive console is an operator-attached concern outside this
    /// crate's scope, so this is the full extent of what the scheduler
    /// itself tracks about it.
    pub repl_enabled: AtomicBool,
    component_handle: Mutex<Option<ComponentHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        config: SchedulerConfig,
        executor: Arc<dyn ExecutorClient>,
        mergeability: Arc<dyn MergeabilityOracle>,
        config_loader: SharedTenantConfigLoader,
    ) -> Self {
        Self {
            components: Arc::new(ComponentRegistry::new(client.clone())),
            nodepool: Arc::new(NodeRequestService::new(client.clone())),
            reporters: Arc::new(ReportRegistry::new()),
            layout_store: LayoutStore::new(client.clone()),
            global_management_queue: ManagementEventQueue::new(client.clone(), "/events/management/global"),
            config_loader,
            client,
            config,
            executor,
            mergeability,
            tenants: RwLock::new(BTreeMap::new()),
            wake: Notify::new(),
            stop: AtomicBool::new(false),
            repl_enabled: AtomicBool::new(false),
            component_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn wake_main_loop(&self) {
        self.wake.notify_one();
    }

    pub fn global_management_queue(&self) -> &ManagementEventQueue {
        &self.global_management_queue
    }

    pub fn config_loader(&self) -> &SharedTenantConfigLoader {
        &self.config_loader
    }

    /// Registers this process in `/components/scheduler` so the rest of the
    /// fleet (and the stats leader election, spec §4.K) can see it.
    pub async fn register_component(&self) -> Result<(), SchedulerError> {
        let mut reg = ComponentRegistration::new(&self.config.component.hostname, ComponentKind::Scheduler);
        reg.zone = self.config.component.zone.clone();
        reg.state = zuul_types::ComponentState::Running;
        reg.accepting_work = true;
        let handle = self.components.register(reg).await?;
        *self.component_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Loads (or replaces) a tenant's runtime: folds `unparsed` into a fresh
    /// `Layout`, builds a manager + store + queues for every configured
    /// pipeline, and swaps it into `tenants` (spec §4.F `loadTenant`).
    pub async fn load_tenant(
        &self,
        name: &str,
        unparsed: UnparsedTenantConfig,
        max_nodes_per_job: u32,
        max_job_timeout: std::time::Duration,
        allowed_labels: Vec<String>,
        allowed_triggers: Vec<String>,
        allowed_reporters: Vec<String>,
    ) -> Result<(), SchedulerError> {
        let layout = build_layout(&unparsed);
        if layout.has_load_errors() {
            for err in &layout.loading_errors {
                warn!(tenant = %name, source = %err.source, message = %err.message, "layout load error");
            }
        }

        let tenant = Tenant {
            name: TenantName::from(name),
            max_nodes_per_job,
            max_job_timeout,
            allowed_labels,
            allowed_triggers,
            allowed_reporters,
            projects: BTreeMap::new(),
            layout,
        };

        let mut runtime = TenantRuntime::new(self.client.clone(), name, tenant, unparsed);
        self.build_pipelines(&mut runtime).await?;
        runtime.management_queue.ensure_root().await?;
        runtime.trigger_queue.ensure_root().await?;
        runtime.local_layout_state = self.layout_store.get(&TenantName::from(name)).await?;

        self.tenants.write().await.insert(name.to_string(), runtime);
        info!(tenant = %name, "tenant loaded");
        self.wake_main_loop();
        Ok(())
    }

    /// Swaps a reconfigured tenant's `Layout`/`UnparsedTenantConfig` into
    /// its running `TenantRuntime`, building a pipeline handle for every
    /// newly configured pipeline and dropping ones no longer in the layout.
    /// Pipelines unchanged by name keep their existing manager and queues —
    /// only reconfigured-away pipelines lose their handle (their CS state
    /// is left in place, reachable again if the pipeline returns).
    pub async fn reload_tenant_layout(
        &self,
        tenant: &str,
        unparsed: UnparsedTenantConfig,
        layout: Layout,
    ) -> Result<(), SchedulerError> {
        let mut tenants = self.tenants.write().await;
        let Some(runtime) = tenants.get_mut(tenant) else {
            return Ok(());
        };

        runtime.tenant.layout = layout;
        runtime.unparsed = unparsed;
        runtime.local_layout_state = self.layout_store.get(&TenantName::from(tenant)).await?;

        let configured: std::collections::BTreeSet<String> =
            runtime.tenant.layout.pipelines.keys().cloned().collect();
        runtime.pipelines.retain(|name, _| configured.contains(name));

        self.build_pipelines(runtime).await?;
        Ok(())
    }

    async fn build_pipelines(&self, runtime: &mut TenantRuntime) -> Result<(), SchedulerError> {
        let name = runtime.name.clone();
        for pipeline_config in runtime.tenant.layout.pipelines.values() {
            if runtime.pipelines.contains_key(&pipeline_config.name) {
                continue;
            }
            let manager = build_manager(
                pipeline_config,
                &name,
                self.executor.clone(),
                Arc::new(SemaphoreHandler::new(self.client.clone(), TenantName::from(name.as_str()))),
                self.nodepool.clone(),
                self.reporters.clone(),
                self.mergeability.clone(),
            );
            let handle = PipelineHandle::new(self.client.clone(), &name, manager);
            handle.store.ensure_root().await?;
            runtime.pipelines.insert(pipeline_config.name.clone(), handle);
        }
        Ok(())
    }

    /// Spawns every background task a running scheduler needs and returns
    /// control to the caller; `stop()` winds them all down.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.register_component().await?;
        self.global_management_queue.ensure_root().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(crate::mainloop::run(self.clone())));
        tasks.extend(crate::cleanup::spawn_all(self.clone()));
        tasks.push(tokio::spawn(crate::stats::run(self.clone())));
        tasks.push(tokio::spawn(crate::layout_update::run(self.clone())));

        let socket_scheduler = self.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::socket::serve(socket_scheduler).await {
                warn!(error = %e, "command socket exited");
            }
        }));

        Ok(())
    }

    /// Graceful shutdown (spec §6 `stop`): stop accepting new work, abort
    /// background tasks, and deregister so the fleet doesn't wait for a
    /// session timeout to notice this scheduler is gone.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.stop.store(true, Ordering::SeqCst);
        self.wake_main_loop();

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(handle) = self.component_handle.lock().await.take() {
            handle.deregister().await?;
        }
        Ok(())
    }
}
