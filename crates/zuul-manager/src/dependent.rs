//! The dependent (gate) manager (spec §4.H): one ordered queue per
//! configured queue name, NNFI reparenting active, and a head's merge
//! failure immediately fails every item behind it — the defining property of
//! "gating", where a failing change must not drag its followers down with it
//! only to have them fail for an unrelated reason later.

use std::collections::HashSet;

use async_trait::async_trait;
use zuul_layout::{Layout, PipelineConfig};
use zuul_types::{ItemId, TriggerEvent};

use crate::base::BaseManager;
use crate::error::ManagerError;
use crate::runtime::{AddChangeRequest, PipelineRuntime};
use crate::PipelineManager;

pub struct DependentManager {
    base: BaseManager,
    config: PipelineConfig,
}

impl DependentManager {
    pub fn new(base: BaseManager, config: PipelineConfig) -> Self {
        Self { base, config }
    }

    fn queue_id_for(&self, req: &AddChangeRequest) -> String {
        self.config
            .queue_names
            .first()
            .cloned()
            .unwrap_or_else(|| format!("dynamic-{}", req.change))
    }
}

#[async_trait]
impl PipelineManager for DependentManager {
    fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn event_matches(&self, event: &TriggerEvent) -> bool {
        BaseManager::event_matches(&self.config, event)
    }

    async fn add_change(&self, runtime: &mut PipelineRuntime, req: AddChangeRequest) -> Result<bool, ManagerError> {
        let queue_id = self.queue_id_for(&req);
        let mut history = HashSet::new();
        self.base.add_change(runtime, &self.config, queue_id, req, &mut history).await
    }

    async fn remove_item(&self, runtime: &mut PipelineRuntime, layout: &Layout, item: ItemId) -> Result<(), ManagerError> {
        self.base.remove_item(runtime, layout, item).await
    }

    fn promote_queue(&self, runtime: &mut PipelineRuntime, queue_id: &str) {
        BaseManager::promote_queue(&mut runtime.queues, queue_id);
    }

    async fn process_queue(&self, runtime: &mut PipelineRuntime, layout: &Layout) -> Result<bool, ManagerError> {
        let queue_ids: Vec<String> = runtime
            .queues
            .iter()
            .filter(|q| q.pipeline == self.config.name)
            .map(|q| q.id.clone())
            .collect();

        let mut changed = false;
        for queue_id in queue_ids {
            changed |= self
                .base
                .process_queue(runtime, &self.config, layout, &queue_id, true)
                .await?;
        }
        Ok(changed)
    }
}
