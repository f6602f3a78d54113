//! The serial manager (spec §4.H): a single queue shared by the whole
//! pipeline, with exactly one item actionable at a time regardless of the
//! configured window — useful for a "post" pipeline whose jobs must run
//! strictly one change after another (e.g. publishing in commit order).

use std::collections::HashSet;

use async_trait::async_trait;
use zuul_layout::{Layout, PipelineConfig};
use zuul_types::{ItemId, TriggerEvent};

use crate::base::BaseManager;
use crate::error::ManagerError;
use crate::runtime::{AddChangeRequest, PipelineRuntime};
use crate::PipelineManager;

pub struct SerialManager {
    base: BaseManager,
    config: PipelineConfig,
}

impl SerialManager {
    pub fn new(base: BaseManager, config: PipelineConfig) -> Self {
        Self { base, config }
    }

    fn queue_id(&self) -> String {
        format!("serial-{}", self.config.name)
    }
}

#[async_trait]
impl PipelineManager for SerialManager {
    fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn event_matches(&self, event: &TriggerEvent) -> bool {
        BaseManager::event_matches(&self.config, event)
    }

    async fn add_change(&self, runtime: &mut PipelineRuntime, req: AddChangeRequest) -> Result<bool, ManagerError> {
        let queue_id = self.queue_id();
        let mut history = HashSet::new();
        self.base.add_change(runtime, &self.config, queue_id, req, &mut history).await
    }

    async fn remove_item(&self, runtime: &mut PipelineRuntime, layout: &Layout, item: ItemId) -> Result<(), ManagerError> {
        self.base.remove_item(runtime, layout, item).await
    }

    fn promote_queue(&self, runtime: &mut PipelineRuntime, queue_id: &str) {
        BaseManager::promote_queue(&mut runtime.queues, queue_id);
    }

    /// A serial queue only ever actions its head: forcing `window = 1`
    /// before each pass rather than trusting the configured policy keeps
    /// "serial" true even if a reconfigure widens it by mistake.
    async fn process_queue(&self, runtime: &mut PipelineRuntime, layout: &Layout) -> Result<bool, ManagerError> {
        let queue_id = self.queue_id();
        if let Some(q) = runtime.queue_mut(&queue_id) {
            q.window = 1;
        }
        self.base
            .process_queue(runtime, &self.config, layout, &queue_id, false)
            .await
    }
}
