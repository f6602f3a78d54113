//! The independent (check) manager (spec §4.H): every change gets its own
//! single-item dynamic queue, so one change's jobs can never block or be
//! blocked by another's — the defining property of "check", which reports
//! a verdict without any ordering guarantee across changes.

use std::collections::HashSet;

use async_trait::async_trait;
use zuul_layout::{Layout, PipelineConfig};
use zuul_types::{ItemId, TriggerEvent};

use crate::base::BaseManager;
use crate::error::ManagerError;
use crate::runtime::{AddChangeRequest, PipelineRuntime};
use crate::PipelineManager;

pub struct IndependentManager {
    base: BaseManager,
    config: PipelineConfig,
}

impl IndependentManager {
    pub fn new(base: BaseManager, config: PipelineConfig) -> Self {
        Self { base, config }
    }
}

#[async_trait]
impl PipelineManager for IndependentManager {
    fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn event_matches(&self, event: &TriggerEvent) -> bool {
        BaseManager::event_matches(&self.config, event)
    }

    async fn add_change(&self, runtime: &mut PipelineRuntime, req: AddChangeRequest) -> Result<bool, ManagerError> {
        let queue_id = format!("independent-{}", req.change);
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
                .process_queue(runtime, &self.config, layout, &queue_id, false)
                .await?;
        }
        Ok(changed)
    }
}
