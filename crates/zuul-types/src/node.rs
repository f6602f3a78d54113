//! Pooled build resources (spec §3, §4.D).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRequestState {
    Requested,
    Pending,
    Fulfilled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    pub id: Option<Uuid>,
    pub labels: Vec<String>,
    pub priority: i32,
    pub relative_priority: i32,
    pub state: NodeRequestState,
    pub allocated_nodes: Vec<String>,
    pub requestor: String,
    pub state_time: DateTime<Utc>,
}

impl NodeRequest {
    pub fn new(labels: Vec<String>, priority: i32, requestor: impl Into<String>) -> Self {
        Self {
            id: None,
            labels,
            priority,
            relative_priority: 0,
            state: NodeRequestState::Requested,
            allocated_nodes: Vec::new(),
            requestor: requestor.into(),
            state_time: Utc::now(),
        }
    }

    /// True once the allocator has written back labels and the request has
    /// not since been invalidated by session loss (spec §4.D step 3).
    pub fn is_ready_to_accept(&self) -> bool {
        self.id.is_some()
            && self.state == NodeRequestState::Fulfilled
            && self.allocated_nodes.len() == self.labels.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Ready,
    InUse,
    Used,
    Hold,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub state: NodeState,
    pub lock_holder: Option<String>,
    pub connection_info: serde_json::Value,
}

/// An autohold directive: when `job_name` fails on `project`/`ref`, park one
/// of its nodes in [`NodeState::Hold`] instead of releasing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldRequest {
    pub id: Uuid,
    pub tenant: String,
    pub project: String,
    pub job_name: String,
    pub ref_filter: String,
    pub comment: String,
    /// Versioned count of how many times this autohold has fired; the
    /// coordination store increments it on write, so readers always see a
    /// monotonic count even across crash-restart (spec §4.D).
    pub current_count: u32,
    pub max_count: u32,
}

impl HoldRequest {
    /// Autoholds are exhausted once `current_count` reaches `max_count`;
    /// `max_count == 0` means unlimited.
    pub fn exhausted(&self) -> bool {
        self.max_count != 0 && self.current_count >= self.max_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_not_ready_until_all_labels_allocated() {
        let mut req = NodeRequest::new(vec!["ubuntu".into(), "ubuntu".into()], 100, "sched-1");
        req.id = Some(Uuid::new_v4());
        req.state = NodeRequestState::Fulfilled;
        req.allocated_nodes = vec!["n1".into()];
        assert!(!req.is_ready_to_accept());
        req.allocated_nodes.push("n2".into());
        assert!(req.is_ready_to_accept());
    }

    #[test]
    fn hold_request_exhaustion() {
        let mut hr = HoldRequest {
            id: Uuid::new_v4(),
            tenant: "t".into(),
            project: "p".into(),
            job_name: "job1".into(),
            ref_filter: "refs/heads/main".into(),
            comment: "debugging".into(),
            current_count: 0,
            max_count: 1,
        };
        assert!(!hr.exhausted());
        hr.current_count = 1;
        assert!(hr.exhausted());
    }
}
