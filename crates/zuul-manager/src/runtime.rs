//! The mutable working set one pipeline's manager operates on for the
//! duration of a processing pass (spec §3, §4.G). A scheduler loads this
//! from the [`zuul_pipeline_state`] store before calling into a manager, and
//! persists it back afterward — this crate never talks to the coordination
//! store directly, only to the in-memory shapes the store crate defines.

use std::collections::BTreeMap;

use zuul_pipeline_state::{BuildSet, ChangeQueue, QueueItem};
use zuul_types::{BuildSetId, ItemId};

#[derive(Debug, Default)]
pub struct PipelineRuntime {
    pub queues: Vec<ChangeQueue>,
    pub items: BTreeMap<ItemId, QueueItem>,
    pub buildsets: BTreeMap<BuildSetId, BuildSet>,
}

impl PipelineRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_mut(&mut self, id: &str) -> Option<&mut ChangeQueue> {
        self.queues.iter_mut().find(|q| q.id == id)
    }

    pub fn queue(&self, id: &str) -> Option<&ChangeQueue> {
        self.queues.iter().find(|q| q.id == id)
    }

    pub fn queue_for_item(&self, item: ItemId) -> Option<&ChangeQueue> {
        self.queues.iter().find(|q| q.queue.contains(&item))
    }

    /// Finds a live item already enqueued for `change` anywhere in this
    /// pipeline — `add_change` must refuse a duplicate live enqueue
    /// (spec §4.H step 1).
    pub fn find_live_item(&self, change: &str) -> Option<ItemId> {
        self.items
            .values()
            .find(|item| item.live && item.change == change)
            .map(|item| item.id)
    }

    pub fn buildset_for(&self, item: ItemId) -> Option<&BuildSet> {
        let current = self.items.get(&item)?.current_buildset?;
        self.buildsets.get(&current)
    }

    pub fn buildset_for_mut(&mut self, item: ItemId) -> Option<&mut BuildSet> {
        let current = self.items.get(&item)?.current_buildset?;
        self.buildsets.get_mut(&current)
    }

    pub fn remove_item(&mut self, item: ItemId) -> Option<QueueItem> {
        for queue in &mut self.queues {
            queue.remove(item);
        }
        self.items.remove(&item)
    }
}

/// What's needed to enqueue one change (spec §4.H `addChange`). The
/// dependency-ahead/behind resolution it may trigger is handled by a
/// [`crate::base::DependencyResolver`] the caller supplies, since knowing
/// what a change depends on is itself sourced from the external source
/// system (spec §1).
#[derive(Debug, Clone)]
pub struct AddChangeRequest {
    pub change: String,
    pub live: bool,
    pub ignore_requirements: bool,
    /// Already-resolved job names this item's buildset should run, frozen at
    /// enqueue time from the tenant's `Layout` (spec §3).
    pub job_graph: Vec<String>,
    /// Names of other changes this change must land behind, in the same
    /// queue, before it may merge (spec §4.H step 1 "changes ahead").
    pub dependencies: Vec<String>,
    /// Grouping key for [`crate::supercedent::SupercedentManager`]: a new
    /// change sharing this key with a not-yet-started item supersedes it
    /// (spec §4.H, supercedent manager). Defaults to `change` itself, which
    /// makes superseding a no-op for every other manager kind.
    pub supersede_key: Option<String>,
}

impl AddChangeRequest {
    pub fn new(change: impl Into<String>, live: bool, job_graph: Vec<String>) -> Self {
        Self {
            change: change.into(),
            live,
            ignore_requirements: false,
            job_graph,
            dependencies: Vec::new(),
            supersede_key: None,
        }
    }
}
