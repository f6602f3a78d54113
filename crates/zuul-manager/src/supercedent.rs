//! The supercedent manager (spec §4.H): like independent, but a new change
//! sharing an [`AddChangeRequest::supersede_key`] with an item that hasn't
//! started any builds yet replaces it instead of queuing alongside it —
//! useful for a periodic pipeline where only the latest tip of a ref is
//! worth building and an unstarted prior run is just wasted capacity.

use std::collections::HashSet;

use async_trait::async_trait;
use zuul_layout::{Layout, PipelineConfig};
use zuul_types::{ItemId, TriggerEvent};

use crate::base::BaseManager;
use crate::error::ManagerError;
use crate::runtime::{AddChangeRequest, PipelineRuntime};
use crate::PipelineManager;

pub struct SupercedentManager {
    base: BaseManager,
    config: PipelineConfig,
}

impl SupercedentManager {
    pub fn new(base: BaseManager, config: PipelineConfig) -> Self {
        Self { base, config }
    }
}

#[async_trait]
impl PipelineManager for SupercedentManager {
    fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn event_matches(&self, event: &TriggerEvent) -> bool {
        BaseManager::event_matches(&self.config, event)
    }

    async fn add_change(&self, runtime: &mut PipelineRuntime, req: AddChangeRequest) -> Result<bool, ManagerError> {
        let key = req.supersede_key.clone().unwrap_or_else(|| req.change.clone());
        let queue_id = format!("supercedent-{key}");

        if let Some(stale) = runtime.queue(&queue_id).and_then(|q| {
            q.queue
                .iter()
                .copied()
                .find(|id| runtime.buildset_for(*id).map(|bs| bs.builds.is_empty()).unwrap_or(false))
        }) {
            BaseManager::remove_unstarted_item(runtime, stale);
        }

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
