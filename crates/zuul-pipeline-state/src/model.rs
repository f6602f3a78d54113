//! The in-memory shape of one pipeline's live state (spec §3, §4.G).
//!
//! `item_ahead`/`items_behind` are UUID references rather than pointers
//! (spec §9: object-graph cycles between `QueueItem`/`BuildSet`/`Pipeline`
//! are broken by storing everything by id and resolving lazily), so a
//! [`ChangeQueue`] is really just the ordering authority — `queue` is the
//! head-to-tail `Vec<ItemId>` — and every `QueueItem` separately carries its
//! own ahead/behind pointers, which [`ChangeQueue`] keeps in sync on splice.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zuul_types::{Build, BuildSetId, ItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSet {
    pub id: BuildSetId,
    pub item: ItemId,
    /// Frozen at creation time from the resolved `Layout` (spec §3): the job
    /// names this attempt must run, in dependency-respecting order.
    pub job_graph: Vec<String>,
    pub merge_state: MergeState,
    pub merged_commit: Option<String>,
    pub files: Vec<String>,
    /// job name -> outstanding node request id.
    pub node_requests: BTreeMap<String, uuid::Uuid>,
    pub builds: BTreeMap<String, Build>,
    pub tries: BTreeMap<String, u32>,
    pub unable_to_merge: bool,
    pub warnings: Vec<String>,
}

impl BuildSet {
    pub fn new(item: ItemId, job_graph: Vec<String>) -> Self {
        Self {
            id: BuildSetId::new(),
            item,
            job_graph,
            merge_state: MergeState::Pending,
            merged_commit: None,
            files: Vec::new(),
            node_requests: BTreeMap::new(),
            builds: BTreeMap::new(),
            tries: BTreeMap::new(),
            unable_to_merge: false,
            warnings: Vec::new(),
        }
    }

    pub fn try_count(&self, job: &str) -> u32 {
        self.tries.get(job).copied().unwrap_or(0)
    }

    pub fn bump_try(&mut self, job: &str) -> u32 {
        let count = self.tries.entry(job.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// A job is requestable once it has no node request, no build, and no
    /// prior result (spec §4.H step 4 `provisionNodes`).
    pub fn is_requestable(&self, job: &str) -> bool {
        !self.node_requests.contains_key(job) && !self.builds.contains_key(job)
    }

    /// A job is launchable once every job it depends on (per `deps`) has
    /// completed successfully and this job itself hasn't started.
    pub fn is_launchable(&self, job: &str, deps: &[String]) -> bool {
        if self.builds.contains_key(job) {
            return false;
        }
        deps.iter().all(|dep| {
            self.builds
                .get(dep)
                .map(|b| b.result.map(|r| r.is_successful()).unwrap_or(false))
                .unwrap_or(false)
        })
    }

    pub fn all_jobs_complete(&self) -> bool {
        self.job_graph
            .iter()
            .all(|job| self.builds.get(job).map(|b| b.is_complete()).unwrap_or(false))
    }

    pub fn any_job_failed(&self) -> bool {
        self.builds.values().any(|b| {
            b.result
                .map(|r| r.is_terminal() && !r.is_successful())
                .unwrap_or(false)
        })
    }

    /// Cancels every build that hasn't settled; `reset` additionally clears
    /// node requests and try counters so the next pass starts this
    /// buildset's jobs over from scratch (spec §4.H step 3, NNFI reparenting:
    /// "cancel+reset all its builds (prime=true)" vs. step 2's cancel-only,
    /// "do not reset (prime=false)").
    pub fn cancel_all(&mut self, reset: bool) {
        for build in self.builds.values_mut() {
            if !build.is_complete() {
                build.cancel();
            }
        }
        if reset {
            self.builds.clear();
            self.node_requests.clear();
            self.tries.clear();
            self.merge_state = MergeState::Pending;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingState {
    NotReported,
    Reported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub change: String,
    /// `false` for a non-live wrapper pulled in only to satisfy a
    /// cross-repo dependency (spec §3).
    pub live: bool,
    pub enqueue_time: DateTime<Utc>,
    pub item_ahead: Option<ItemId>,
    pub items_behind: Vec<ItemId>,
    pub current_buildset: Option<BuildSetId>,
    pub reporting_state: ReportingState,
    /// Set when dependencies changed under the item such that it can no
    /// longer merge, but it's retained (not yet removed) until its final
    /// report goes out exactly once (spec §9 open question).
    pub dequeued_needing_change: bool,
    /// Set once this item has been determined to have a failing ancestor in
    /// this pipeline (spec §4.H step 2); distinct from its own jobs failing.
    pub failing: bool,
}

impl QueueItem {
    pub fn new(change: impl Into<String>, live: bool) -> Self {
        Self {
            id: ItemId::new(),
            change: change.into(),
            live,
            enqueue_time: Utc::now(),
            item_ahead: None,
            items_behind: Vec::new(),
            current_buildset: None,
            reporting_state: ReportingState::NotReported,
            dequeued_needing_change: false,
            failing: false,
        }
    }

    pub fn is_head(&self) -> bool {
        self.item_ahead.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeQueue {
    pub id: String,
    pub pipeline: String,
    /// `(project, branch)` pairs this queue accepts, empty meaning "global"
    /// (independent-pipeline per-change queues, spec §3).
    pub project_branches: Vec<(String, String)>,
    pub window: u32,
    /// Created on demand for a change with no statically configured queue
    /// (spec §4.H step 3); removed once empty.
    pub dynamic: bool,
    /// Head-to-tail item ordering. The authority for position — every
    /// `QueueItem.item_ahead`/`items_behind` must agree with this vector's
    /// adjacency (spec §8 invariant).
    pub queue: Vec<ItemId>,
}

impl ChangeQueue {
    pub fn new(id: impl Into<String>, pipeline: impl Into<String>, initial_window: u32) -> Self {
        Self {
            id: id.into(),
            pipeline: pipeline.into(),
            project_branches: Vec::new(),
            window: initial_window,
            dynamic: false,
            queue: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn head(&self) -> Option<ItemId> {
        self.queue.first().copied()
    }

    /// Appends `item` behind `after` (or at the tail if `after` is `None`),
    /// updating this queue's ordering vector. The caller is responsible for
    /// fixing up the corresponding `QueueItem.item_ahead`/`items_behind`
    /// fields — this type only owns positional order.
    pub fn insert_after(&mut self, item: ItemId, after: Option<ItemId>) {
        match after {
            None => self.queue.insert(0, item),
            Some(after) => {
                let idx = self.queue.iter().position(|i| *i == after);
                match idx {
                    Some(idx) => self.queue.insert(idx + 1, item),
                    None => self.queue.push(item),
                }
            }
        }
    }

    pub fn remove(&mut self, item: ItemId) {
        self.queue.retain(|i| *i != item);
    }

    /// All items from the head through (and including) the first `window`
    /// live+non-live slots — the actionable set jobs may launch for
    /// (spec §4.H step 4, glossary "Window").
    pub fn actionable(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.queue.iter().take(self.window.max(1) as usize).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub pipeline: String,
    pub queue_ids: Vec<String>,
    pub item_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_after_head_puts_item_first() {
        let mut q = ChangeQueue::new("integrated", "gate", 20);
        let a = ItemId::new();
        let b = ItemId::new();
        q.insert_after(a, None);
        q.insert_after(b, Some(a));
        assert_eq!(q.queue, vec![a, b]);
    }

    #[test]
    fn actionable_respects_window() {
        let mut q = ChangeQueue::new("integrated", "gate", 2);
        let items: Vec<ItemId> = (0..4).map(|_| ItemId::new()).collect();
        for (i, item) in items.iter().enumerate() {
            let after = if i == 0 { None } else { Some(items[i - 1]) };
            q.insert_after(*item, after);
        }
        assert_eq!(q.actionable().count(), 2);
    }

    #[test]
    fn buildset_reset_clears_requests_and_tries_but_not_reset_only_cancels() {
        let item = ItemId::new();
        let mut bs = BuildSet::new(item, vec!["job1".into()]);
        bs.bump_try("job1");
        bs.node_requests.insert("job1".into(), uuid::Uuid::new_v4());
        bs.builds.insert("job1".into(), Build::new("job1"));

        bs.cancel_all(false);
        assert!(bs.builds["job1"].canceled);
        assert_eq!(bs.try_count("job1"), 1);

        bs.cancel_all(true);
        assert!(bs.builds.is_empty());
        assert!(bs.node_requests.is_empty());
        assert_eq!(bs.try_count("job1"), 0);
    }

    #[test]
    fn is_launchable_requires_all_deps_successful() {
        let item = ItemId::new();
        let mut bs = BuildSet::new(item, vec!["build".into(), "test".into()]);
        assert!(!bs.is_launchable("test", &["build".to_string()]));

        let mut build = Build::new("build");
        build.complete(zuul_types::BuildResult::Success, Utc::now());
        bs.builds.insert("build".into(), build);
        assert!(bs.is_launchable("test", &["build".to_string()]));
    }
}
