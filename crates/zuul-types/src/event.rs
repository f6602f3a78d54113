//! The three event shapes that flow through the event queues (spec §4.B).
//!
//! The source system dispatches on Python class hierarchies; here each kind
//! is a tagged-variant enum carried inside [`Event`], per the redesign note
//! in spec §9 ("dynamic class-based event dispatch" → tagged enum).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ack::AckRef;
use crate::ids::TenantName;

/// Logical time assigned by the coordination store's transaction counter.
pub type Ltime = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub tenant: TenantName,
    pub project: String,
    pub branch: Option<String>,
    pub change: String,
    /// Which trigger fired this (`patchset-created`, `ref-updated`, `comment-added`, ...).
    pub trigger_name: String,
    /// Raw key/value payload from the driver; interpretation is driver-specific
    /// and out of scope here (spec §1).
    pub payload: serde_json::Value,
    pub zuul_event_ltime: Ltime,
    /// Latest reconfigure ltime known to the producer when this event was
    /// forwarded; a pipeline must not act on this event using a Layout older
    /// than this ltime.
    pub min_reconfigure_ltime: Ltime,
    pub branch_cache_ltime: Option<Ltime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ManagementEvent {
    FullReconfigure,
    SmartReconfigure,
    TenantReconfigure {
        tenant: TenantName,
        /// (project, branch) pairs whose cached files must be invalidated.
        project_branches: Vec<(String, String)>,
    },
    Promote {
        tenant: TenantName,
        pipeline: String,
        queue: String,
    },
    Enqueue {
        tenant: TenantName,
        pipeline: String,
        project: String,
        change: String,
    },
    Dequeue {
        tenant: TenantName,
        pipeline: String,
        project: String,
        change: String,
    },
}

impl ManagementEvent {
    /// Two management events are mergeable (spec §4.B) if they are both
    /// `TenantReconfigure` for the same tenant; the merge unions the
    /// project/branch invalidation sets.
    pub fn merge_key(&self) -> Option<&TenantName> {
        match self {
            ManagementEvent::TenantReconfigure { tenant, .. } => Some(tenant),
            _ => None,
        }
    }

    pub fn merge_from(&mut self, other: ManagementEvent) {
        if let (
            ManagementEvent::TenantReconfigure {
                project_branches, ..
            },
            ManagementEvent::TenantReconfigure {
                project_branches: mut other_pb,
                ..
            },
        ) = (&mut *self, other)
        {
            for pb in other_pb.drain(..) {
                if !project_branches.contains(&pb) {
                    project_branches.push(pb);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResultEvent {
    BuildStarted {
        build: crate::ids::BuildId,
        worker: String,
    },
    BuildPaused {
        build: crate::ids::BuildId,
    },
    BuildCompleted {
        build: crate::ids::BuildId,
        result: crate::build::BuildResult,
        data: serde_json::Value,
        warnings: Vec<String>,
        end_time: DateTime<Utc>,
    },
    MergeCompleted {
        item: crate::ids::ItemId,
        merged: bool,
        commit: Option<String>,
        files: Vec<String>,
    },
    NodesProvisioned {
        request: uuid::Uuid,
        nodes: Vec<String>,
    },
}

/// One entry in any of the three event queues: a payload plus the ack
/// reference needed to delete it once processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T> {
    pub payload: T,
    pub ack_ref: AckRef,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_reconfigure_merges_project_branches() {
        let mut a = ManagementEvent::TenantReconfigure {
            tenant: TenantName::from("t1"),
            project_branches: vec![("proj".into(), "main".into())],
        };
        let b = ManagementEvent::TenantReconfigure {
            tenant: TenantName::from("t1"),
            project_branches: vec![
                ("proj".into(), "main".into()),
                ("proj".into(), "stable".into()),
            ],
        };
        a.merge_from(b);
        match a {
            ManagementEvent::TenantReconfigure {
                project_branches, ..
            } => assert_eq!(project_branches.len(), 2),
            _ => unreachable!(),
        }
    }
}
