//! Coordination-store persistence for one pipeline's queues/items/buildsets
//! (spec §4.G): a tree under `/pipelines/<tenant>/<pipeline>/...` with one
//! CS node per queue, item, buildset, and build, each tracking its own CS
//! version so a version mismatch on write is a property of the store layer,
//! not the payload (spec §10).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use zuul_types::{Build, BuildSetId, ItemId};
use zuul_zk::{CoordinationClient, ZkError};

use crate::model::{BuildSet, ChangeQueue, MergeState, QueueItem};

/// On-disk shape of a buildset's own node — everything except its builds,
/// which live as separate `job/<name>` children so one job's result landing
/// doesn't require rewriting every other job's state (spec §4.G tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildSetMeta {
    id: BuildSetId,
    item: ItemId,
    job_graph: Vec<String>,
    merge_state: MergeState,
    merged_commit: Option<String>,
    files: Vec<String>,
    node_requests: BTreeMap<String, uuid::Uuid>,
    tries: BTreeMap<String, u32>,
    unable_to_merge: bool,
    warnings: Vec<String>,
}

impl From<&BuildSet> for BuildSetMeta {
    fn from(bs: &BuildSet) -> Self {
        Self {
            id: bs.id,
            item: bs.item,
            job_graph: bs.job_graph.clone(),
            merge_state: bs.merge_state,
            merged_commit: bs.merged_commit.clone(),
            files: bs.files.clone(),
            node_requests: bs.node_requests.clone(),
            tries: bs.tries.clone(),
            unable_to_merge: bs.unable_to_merge,
            warnings: bs.warnings.clone(),
        }
    }
}

pub struct PipelineStateStore {
    client: Arc<dyn CoordinationClient>,
    root: String,
}

impl PipelineStateStore {
    pub fn new(client: Arc<dyn CoordinationClient>, tenant: &str, pipeline: &str) -> Self {
        Self {
            client,
            root: format!("/pipelines/{tenant}/{pipeline}"),
        }
    }

    async fn ensure(&self, path: &str) -> Result<(), ZkError> {
        if self.client.exists(path).await?.is_none() {
            match self.client.create(path, b"", false, false).await {
                Ok(_) | Err(ZkError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn ensure_root(&self) -> Result<(), ZkError> {
        self.ensure(&self.root).await?;
        self.ensure(&format!("{}/queues", self.root)).await?;
        self.ensure(&format!("{}/items", self.root)).await?;
        self.ensure(&format!("{}/old_queues", self.root)).await?;
        Ok(())
    }

    async fn write_node<T: Serialize>(&self, path: &str, value: &T) -> Result<(), ZkError> {
        let data = serde_json::to_vec(value).map_err(|e| ZkError::Other(e.to_string()))?;
        match self.client.exists(path).await? {
            Some(stat) => {
                self.client.set(path, &data, stat.version).await?;
            }
            None => {
                self.client.create(path, &data, false, false).await?;
            }
        }
        Ok(())
    }

    async fn read_node<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>, ZkError> {
        match self.client.get(path).await {
            Ok((data, _)) => Ok(Some(
                serde_json::from_slice(&data).map_err(|e| ZkError::Other(e.to_string()))?,
            )),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -- Queues ------------------------------------------------------

    pub async fn persist_queue(&self, queue: &ChangeQueue) -> Result<(), ZkError> {
        self.write_node(&format!("{}/queues/{}", self.root, queue.id), queue)
            .await
    }

    pub async fn load_queue(&self, id: &str) -> Result<Option<ChangeQueue>, ZkError> {
        self.read_node(&format!("{}/queues/{id}", self.root)).await
    }

    pub async fn all_queue_ids(&self) -> Result<Vec<String>, ZkError> {
        match self.client.children(&format!("{}/queues", self.root)).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_no_node() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_queue(&self, id: &str) -> Result<(), ZkError> {
        match self
            .client
            .delete(&format!("{}/queues/{id}", self.root), -1, false)
            .await
        {
            Ok(()) | Err(ZkError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -- Items ---------------------------------------------------------

    pub async fn persist_item(&self, item: &QueueItem) -> Result<(), ZkError> {
        self.write_node(&format!("{}/items/{}", self.root, item.id), item)
            .await
    }

    pub async fn load_item(&self, id: ItemId) -> Result<Option<QueueItem>, ZkError> {
        self.read_node(&format!("{}/items/{id}", self.root)).await
    }

    pub async fn delete_item(&self, id: ItemId) -> Result<(), ZkError> {
        match self
            .client
            .delete(&format!("{}/items/{id}", self.root), -1, true)
            .await
        {
            Ok(()) | Err(ZkError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -- BuildSets (with nested per-job build nodes) --------------------

    fn buildset_path(&self, item: ItemId, buildset: BuildSetId) -> String {
        format!("{}/items/{item}/buildset/{buildset}", self.root)
    }

    pub async fn persist_buildset(&self, buildset: &BuildSet) -> Result<(), ZkError> {
        let path = self.buildset_path(buildset.item, buildset.id);
        self.ensure(&format!("{}/items/{}/buildset", self.root, buildset.item))
            .await?;
        self.write_node(&path, &BuildSetMeta::from(buildset)).await?;
        self.ensure(&format!("{path}/job")).await?;
        for (job, build) in &buildset.builds {
            self.write_node(&format!("{path}/job/{job}"), build).await?;
        }
        Ok(())
    }

    pub async fn load_buildset(
        &self,
        item: ItemId,
        buildset: BuildSetId,
    ) -> Result<Option<BuildSet>, ZkError> {
        let path = self.buildset_path(item, buildset);
        let meta: Option<BuildSetMeta> = self.read_node(&path).await?;
        let Some(meta) = meta else { return Ok(None) };

        let mut builds = BTreeMap::new();
        let job_names = self
            .client
            .children(&format!("{path}/job"))
            .await
            .unwrap_or_default();
        for name in job_names {
            match self.read_node::<Build>(&format!("{path}/job/{name}")).await {
                Ok(Some(build)) => {
                    builds.insert(name, build);
                }
                Ok(None) => {}
                Err(e) => warn!(job = %name, error = %e, "failed to load build"),
            }
        }

        Ok(Some(BuildSet {
            id: meta.id,
            item: meta.item,
            job_graph: meta.job_graph,
            merge_state: meta.merge_state,
            merged_commit: meta.merged_commit,
            files: meta.files,
            node_requests: meta.node_requests,
            builds,
            tries: meta.tries,
            unable_to_merge: meta.unable_to_merge,
            warnings: meta.warnings,
        }))
    }

    // -- Dirty flag ------------------------------------------------------
    //
    // A single marker node under the pipeline root; any scheduler can read
    // it to decide whether this pipeline needs a processing pass even with
    // no pending events (spec §4.G, §4.I main loop `if ... not dirty: continue`).

    fn dirty_path(&self) -> String {
        format!("{}/dirty", self.root)
    }

    pub async fn is_dirty(&self) -> Result<bool, ZkError> {
        Ok(self.client.exists(&self.dirty_path()).await?.is_some())
    }

    pub async fn set_dirty(&self) -> Result<(), ZkError> {
        match self.client.create(&self.dirty_path(), b"", false, false).await {
            Ok(_) | Err(ZkError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn clear_dirty(&self) -> Result<(), ZkError> {
        match self.client.delete(&self.dirty_path(), -1, false).await {
            Ok(()) | Err(ZkError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -- Old-queue reenqueue (spec §4.G) --------------------------------
    //
    // On reconfiguration, the manager copies queues that no longer
    // structurally match the new layout aside into `old_queues/<id>`
    // instead of discarding them so their items can be walked and
    // re-enqueued under the new structure on the next pipeline pass.

    pub async fn move_to_old_queues(&self, queue: &ChangeQueue) -> Result<(), ZkError> {
        self.write_node(&format!("{}/old_queues/{}", self.root, queue.id), queue)
            .await?;
        self.delete_queue(&queue.id).await
    }

    pub async fn all_old_queues(&self) -> Result<Vec<ChangeQueue>, ZkError> {
        let ids = match self
            .client
            .children(&format!("{}/old_queues", self.root))
            .await
        {
            Ok(v) => v,
            Err(e) if e.is_no_node() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(q) = self
                .read_node::<ChangeQueue>(&format!("{}/old_queues/{id}", self.root))
                .await?
            {
                out.push(q);
            }
        }
        Ok(out)
    }

    pub async fn clear_old_queue(&self, id: &str) -> Result<(), ZkError> {
        match self
            .client
            .delete(&format!("{}/old_queues/{id}", self.root), -1, true)
            .await
        {
            Ok(()) | Err(ZkError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_types::BuildResult;
    use zuul_zk::MemoryCoordinationClient;

    fn store() -> PipelineStateStore {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        PipelineStateStore::new(client, "t1", "gate")
    }

    #[tokio::test]
    async fn queue_round_trips() {
        let store = store();
        store.ensure_root().await.unwrap();
        let queue = ChangeQueue::new("integrated", "gate", 20);
        store.persist_queue(&queue).await.unwrap();
        let loaded = store.load_queue("integrated").await.unwrap().unwrap();
        assert_eq!(loaded.id, queue.id);
    }

    #[tokio::test]
    async fn buildset_round_trips_with_nested_builds() {
        let store = store();
        store.ensure_root().await.unwrap();
        let item = ItemId::new();
        let itemv = QueueItem::new("123,1", true);
        store.persist_item(&itemv).await.unwrap();

        let mut bs = BuildSet::new(item, vec!["job1".into(), "job2".into()]);
        let mut b = zuul_types::Build::new("job1");
        b.complete(BuildResult::Success, chrono::Utc::now());
        bs.builds.insert("job1".into(), b);

        store.persist_buildset(&bs).await.unwrap();
        let loaded = store.load_buildset(item, bs.id).await.unwrap().unwrap();
        assert_eq!(loaded.job_graph, vec!["job1".to_string(), "job2".to_string()]);
        assert_eq!(loaded.builds["job1"].result, Some(BuildResult::Success));
    }

    #[tokio::test]
    async fn dirty_flag_round_trips_and_is_idempotent() {
        let store = store();
        store.ensure_root().await.unwrap();
        assert!(!store.is_dirty().await.unwrap());
        store.set_dirty().await.unwrap();
        store.set_dirty().await.unwrap();
        assert!(store.is_dirty().await.unwrap());
        store.clear_dirty().await.unwrap();
        store.clear_dirty().await.unwrap();
        assert!(!store.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn old_queue_roundtrips_and_clears() {
        let store = store();
        store.ensure_root().await.unwrap();
        let queue = ChangeQueue::new("integrated", "gate", 20);
        store.persist_queue(&queue).await.unwrap();

        store.move_to_old_queues(&queue).await.unwrap();
        assert!(store.load_queue("integrated").await.unwrap().is_none());

        let old = store.all_old_queues().await.unwrap();
        assert_eq!(old.len(), 1);
        store.clear_old_queue(&queue.id).await.unwrap();
        assert!(store.all_old_queues().await.unwrap().is_empty());
    }
}
