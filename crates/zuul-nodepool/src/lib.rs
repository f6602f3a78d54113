//! The Node Request Service (spec §4.D): priority-sorted requests for build
//! resources, consumed by an external allocator this workspace does not
//! implement (spec §1 — nodepool's own allocation logic is out of scope;
//! this crate is the manager-facing half of the protocol only), plus
//! autohold bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use zuul_types::{HoldRequest, Node, NodeRequest, NodeRequestState, NodeState};
use zuul_zk::{CoordinationClient, ZkError};

const REQUESTS_ROOT: &str = "/nodepool/requests";
const NODES_ROOT: &str = "/nodepool/nodes";
const HOLDS_ROOT: &str = "/nodepool/holds";

#[derive(Debug, Error)]
pub enum NodepoolError {
    #[error(transparent)]
    Zk(#[from] ZkError),
    #[error("{0}")]
    Serde(String),
    #[error("request at {0} is not yet fulfilled")]
    NotReady(String),
}

/// A live request: its CS path (needed to cancel/revise/accept it) plus the
/// last-known record. The path embeds the priority so every scheduler's view
/// of request order agrees without a separate index (spec §4.D step 1).
#[derive(Debug, Clone)]
pub struct NodeRequestHandle {
    pub path: String,
    pub request: NodeRequest,
}

/// The nodes handed back by [`NodeRequestService::accept`], still alive
/// after the request node that reserved them has been deleted.
pub type NodeSet = Vec<Node>;

pub struct NodeRequestService {
    client: Arc<dyn CoordinationClient>,
}

impl NodeRequestService {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    async fn ensure_root(&self, root: &str) -> Result<(), NodepoolError> {
        if self.client.exists(root).await?.is_none() {
            match self.client.create(root, b"", false, false).await {
                Ok(_) | Err(ZkError::NodeExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Writes a request node under a priority-prefixed, sequence-suffixed
    /// path, so lexicographic ordering of `children()` is request order
    /// (lower priority number served first, ties broken by creation order).
    /// `relative_priority` shifts a request within its own priority band
    /// without the caller having to renumber every other request.
    pub async fn request(&self, mut req: NodeRequest) -> Result<NodeRequestHandle, NodepoolError> {
        self.ensure_root(REQUESTS_ROOT).await?;
        let sort_key = req.priority.saturating_sub(req.relative_priority);
        let prefix = format!("{REQUESTS_ROOT}/{sort_key:010}-");

        req.state_time = Utc::now();
        let data = serde_json::to_vec(&req).map_err(|e| NodepoolError::Serde(e.to_string()))?;
        let path = self.client.create(&prefix, &data, false, true).await?;

        info!(path = %path, labels = ?req.labels, "node request submitted");
        Ok(NodeRequestHandle { path, request: req })
    }

    async fn read(&self, path: &str) -> Result<Option<NodeRequest>, NodepoolError> {
        match self.client.get(path).await {
            Ok((data, _)) => Ok(Some(
                serde_json::from_slice(&data).map_err(|e| NodepoolError::Serde(e.to_string()))?,
            )),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent: canceling an already-gone request (fulfilled and
    /// already accepted, or canceled twice) is a no-op.
    pub async fn cancel(&self, handle: &NodeRequestHandle) -> Result<(), NodepoolError> {
        match self.client.delete(&handle.path, -1, true).await {
            Ok(()) | Err(ZkError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// No-ops once the allocator has started fulfilling the request — the
    /// lock sub-node it takes while writing `state=fulfilled` is the signal
    /// this side uses to detect that (spec §4.D `revise_priority`: "must
    /// no-op if the request is already locked by the allocator").
    pub async fn revise_priority(
        &self,
        handle: &mut NodeRequestHandle,
        new_relative_priority: i32,
    ) -> Result<(), NodepoolError> {
        if self.client.exists(&format!("{}/lock", handle.path)).await?.is_some() {
            return Ok(());
        }

        let Some(stat) = self.client.exists(&handle.path).await? else {
            return Ok(());
        };
        handle.request.relative_priority = new_relative_priority;
        let data = serde_json::to_vec(&handle.request).map_err(|e| NodepoolError::Serde(e.to_string()))?;
        self.client.set(&handle.path, &data, stat.version).await?;
        Ok(())
    }

    /// Locks each allocated node, deletes the request node, and returns the
    /// now-owned [`NodeSet`]. If the request node is gone when we go to
    /// accept it — the allocator's session was lost after fulfilling but
    /// before we observed it — the same request is resubmitted fresh rather
    /// than failing the change outright (spec §4.D step 3).
    pub async fn accept(
        &self,
        handle: &NodeRequestHandle,
    ) -> Result<Result<NodeSet, NodeRequestHandle>, NodepoolError> {
        let Some(current) = self.read(&handle.path).await? else {
            warn!(path = %handle.path, "request vanished before accept, resubmitting");
            let resubmitted = self.request(handle.request.clone()).await?;
            return Ok(Err(resubmitted));
        };

        if !current.is_ready_to_accept() {
            return Err(NodepoolError::NotReady(handle.path.clone()));
        }

        let mut nodes = Vec::with_capacity(current.allocated_nodes.len());
        for id in &current.allocated_nodes {
            let node = self.lock_and_transition(id, NodeState::InUse).await?;
            nodes.push(node);
        }

        self.client.delete(&handle.path, -1, true).await.ok();
        Ok(Ok(nodes))
    }

    async fn read_node(&self, id: &str) -> Result<Option<Node>, NodepoolError> {
        let path = format!("{NODES_ROOT}/{id}");
        match self.client.get(&path).await {
            Ok((data, _)) => Ok(Some(
                serde_json::from_slice(&data).map_err(|e| NodepoolError::Serde(e.to_string()))?,
            )),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_node(&self, node: &Node) -> Result<(), NodepoolError> {
        let path = format!("{NODES_ROOT}/{}", node.id);
        let data = serde_json::to_vec(node).map_err(|e| NodepoolError::Serde(e.to_string()))?;
        match self.client.exists(&path).await? {
            Some(stat) => {
                self.client.set(&path, &data, stat.version).await?;
            }
            None => {
                self.ensure_root(NODES_ROOT).await?;
                self.client.create(&path, &data, false, false).await?;
            }
        }
        Ok(())
    }

    async fn lock_and_transition(&self, id: &str, state: NodeState) -> Result<Node, NodepoolError> {
        let mut node = self
            .read_node(id)
            .await?
            .unwrap_or_else(|| Node {
                id: id.to_string(),
                label: String::new(),
                state: NodeState::Ready,
                lock_holder: None,
                connection_info: serde_json::Value::Null,
            });
        node.state = state;
        node.lock_holder = Some("scheduler".to_string());
        self.write_node(&node).await?;
        Ok(node)
    }

    /// Marks an accepted [`NodeSet`] as actively running a build — distinct
    /// from `accept`'s lock so a manager can hold nodes briefly between
    /// acceptance and the executor actually starting (spec §4.D operation
    /// list: `accept`, then separately `use`).
    pub async fn r#use(&self, nodeset: &NodeSet) -> Result<(), NodepoolError> {
        for node in nodeset {
            self.lock_and_transition(&node.id, NodeState::InUse).await?;
        }
        Ok(())
    }

    /// Releases a [`NodeSet`] after a build finishes. If `autohold` names a
    /// matching, unexhausted [`HoldRequest`], the first node is parked in
    /// [`NodeState::Hold`] and the autohold's counter bumped instead of
    /// marking it [`NodeState::Used`] (spec §4.D "Hold requests").
    pub async fn r#return(
        &self,
        nodeset: &NodeSet,
        autohold: Option<&HoldRequest>,
    ) -> Result<(), NodepoolError> {
        for (i, node) in nodeset.iter().enumerate() {
            if i == 0 {
                if let Some(hold) = autohold {
                    self.bump_hold_count(hold.id).await?;
                    self.lock_and_transition(&node.id, NodeState::Hold).await?;
                    continue;
                }
            }
            self.lock_and_transition(&node.id, NodeState::Used).await?;
        }
        Ok(())
    }

    // -- Autoholds -------------------------------------------------------

    pub async fn register_hold(&self, hold: HoldRequest) -> Result<(), NodepoolError> {
        self.ensure_root(HOLDS_ROOT).await?;
        let path = format!("{HOLDS_ROOT}/{}", hold.id);
        let data = serde_json::to_vec(&hold).map_err(|e| NodepoolError::Serde(e.to_string()))?;
        self.client.create(&path, &data, false, false).await?;
        Ok(())
    }

    pub async fn find_matching_hold(
        &self,
        tenant: &str,
        project: &str,
        job_name: &str,
        change_ref: &str,
    ) -> Result<Option<HoldRequest>, NodepoolError> {
        let ids = match self.client.children(HOLDS_ROOT).await {
            Ok(v) => v,
            Err(e) if e.is_no_node() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for id in ids {
            let path = format!("{HOLDS_ROOT}/{id}");
            let Ok((data, _)) = self.client.get(&path).await else { continue };
            let hold: HoldRequest =
                serde_json::from_slice(&data).map_err(|e| NodepoolError::Serde(e.to_string()))?;
            if hold.exhausted() {
                continue;
            }
            if hold.tenant == tenant
                && hold.project == project
                && hold.job_name == job_name
                && (hold.ref_filter == "*" || hold.ref_filter == change_ref)
            {
                return Ok(Some(hold));
            }
        }
        Ok(None)
    }

    /// Optimistic-concurrency increment: retries on a version conflict from
    /// a second scheduler firing the same autohold concurrently, same
    /// pattern as every other versioned counter in the store (spec §4.D:
    /// "the handler counter on the HoldRequest is versioned-incremented").
    pub async fn bump_hold_count(&self, hold_id: Uuid) -> Result<(), NodepoolError> {
        let path = format!("{HOLDS_ROOT}/{hold_id}");
        loop {
            let (data, stat) = self.client.get(&path).await?;
            let mut hold: HoldRequest =
                serde_json::from_slice(&data).map_err(|e| NodepoolError::Serde(e.to_string()))?;
            hold.current_count += 1;
            let updated = serde_json::to_vec(&hold).map_err(|e| NodepoolError::Serde(e.to_string()))?;
            match self.client.set(&path, &updated, stat.version).await {
                Ok(_) => return Ok(()),
                Err(ZkError::BadVersion { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_zk::MemoryCoordinationClient;

    fn service() -> NodeRequestService {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        NodeRequestService::new(client)
    }

    async fn fulfill(svc: &NodeRequestService, handle: &mut NodeRequestHandle, node_ids: Vec<&str>) {
        handle.request.id = Some(Uuid::new_v4());
        handle.request.state = NodeRequestState::Fulfilled;
        handle.request.allocated_nodes = node_ids.into_iter().map(String::from).collect();
        let stat = svc.client.exists(&handle.path).await.unwrap().unwrap();
        let data = serde_json::to_vec(&handle.request).unwrap();
        svc.client.set(&handle.path, &data, stat.version).await.unwrap();
    }

    #[tokio::test]
    async fn requests_sort_by_priority_then_creation_order() {
        let svc = service();
        let low = svc
            .request(NodeRequest::new(vec!["ubuntu".into()], 200, "sched-1"))
            .await
            .unwrap();
        let high = svc
            .request(NodeRequest::new(vec!["ubuntu".into()], 100, "sched-1"))
            .await
            .unwrap();

        let children = svc.client.children(REQUESTS_ROOT).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[0] < children[1]);
        assert!(high.path.contains("0000000100"));
        assert!(low.path.contains("0000000200"));
    }

    #[tokio::test]
    async fn accept_locks_nodes_and_deletes_the_request() {
        let svc = service();
        let mut handle = svc
            .request(NodeRequest::new(vec!["ubuntu".into()], 100, "sched-1"))
            .await
            .unwrap();
        fulfill(&svc, &mut handle, vec!["n1"]).await;

        let outcome = svc.accept(&handle).await.unwrap();
        let nodeset = outcome.expect("should accept, not resubmit");
        assert_eq!(nodeset.len(), 1);
        assert_eq!(nodeset[0].state, NodeState::InUse);
        assert!(svc.client.exists(&handle.path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accept_resubmits_when_request_node_vanished() {
        let svc = service();
        let mut handle = svc
            .request(NodeRequest::new(vec!["ubuntu".into()], 100, "sched-1"))
            .await
            .unwrap();
        fulfill(&svc, &mut handle, vec!["n1"]).await;
        svc.client.delete(&handle.path, -1, true).await.unwrap();

        let outcome = svc.accept(&handle).await.unwrap();
        let resubmitted = outcome.expect_err("should resubmit, not accept");
        assert!(svc.client.exists(&resubmitted.path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revise_priority_noops_once_allocator_holds_the_lock() {
        let svc = service();
        let mut handle = svc
            .request(NodeRequest::new(vec!["ubuntu".into()], 100, "sched-1"))
            .await
            .unwrap();
        svc.client
            .create(&format!("{}/lock", handle.path), b"", true, false)
            .await
            .unwrap();

        svc.revise_priority(&mut handle, 50).await.unwrap();
        assert_eq!(handle.request.relative_priority, 0);
    }

    #[tokio::test]
    async fn autohold_diverts_first_node_to_hold_and_bumps_count() {
        let svc = service();
        let hold = HoldRequest {
            id: Uuid::new_v4(),
            tenant: "t1".into(),
            project: "org/repo".into(),
            job_name: "flaky".into(),
            ref_filter: "*".into(),
            comment: "debugging".into(),
            current_count: 0,
            max_count: 1,
        };
        svc.register_hold(hold.clone()).await.unwrap();

        let found = svc
            .find_matching_hold("t1", "org/repo", "flaky", "refs/heads/main")
            .await
            .unwrap()
            .expect("should match");

        let nodes = vec![Node {
            id: "n1".into(),
            label: "ubuntu".into(),
            state: NodeState::InUse,
            lock_holder: None,
            connection_info: serde_json::Value::Null,
        }];
        svc.r#return(&nodes, Some(&found)).await.unwrap();

        let stored = svc.read_node("n1").await.unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Hold);

        let again = svc
            .find_matching_hold("t1", "org/repo", "flaky", "refs/heads/main")
            .await
            .unwrap();
        assert!(again.is_none(), "hold should be exhausted after one fire");
    }
}
