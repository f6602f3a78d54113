//! Persists the latest [`LayoutState`] per tenant (spec §4.F). A scheduler
//! keeps a `local_layout_state[tenant]` cache and only processes a tenant's
//! pipelines once `local == remote`; the layout update thread (§4.L) is what
//! brings the local copy up to date.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zuul_types::{LayoutId, TenantName};
use zuul_zk::{sharded, CoordinationClient, ZkError};

const ROOT: &str = "/layout";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutState {
    pub uuid: LayoutId,
    /// Coordination-store transaction id this state was written at; the
    /// unit layout comparisons use to decide "is my local copy current"
    /// (spec §4.F, §9 `Ltime`).
    pub ltime: i64,
    pub hostname: String,
    pub last_reconfigured: DateTime<Utc>,
}

/// `project -> branch -> ltime` the most recent reconfigure that
/// invalidated that branch's cached files ran at. A subsequent reconfigure
/// treats a branch's cached files as valid iff `cached_ltime >= min_ltime`
/// for that branch (spec §4.F, §4.I).
pub type BranchCacheMinLtimes = BTreeMap<String, BTreeMap<String, i64>>;

pub struct LayoutStore {
    client: Arc<dyn CoordinationClient>,
}

impl LayoutStore {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    fn state_path(tenant: &TenantName) -> String {
        format!("{ROOT}/{tenant}")
    }

    fn min_ltimes_path(tenant: &TenantName) -> String {
        format!("{ROOT}/{tenant}-min-ltimes")
    }

    pub async fn get(&self, tenant: &TenantName) -> Result<Option<LayoutState>, ZkError> {
        let path = Self::state_path(tenant);
        match self.client.get(&path).await {
            Ok((data, _)) => {
                let state = serde_json::from_slice(&data).map_err(|e| ZkError::Other(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically writes `state`, stamping `ltime` with the transaction id
    /// the coordination store assigns the write (spec §4.F: "`ltime` is the
    /// CS transaction id returned from the write").
    pub async fn set(&self, tenant: &TenantName, mut state: LayoutState) -> Result<LayoutState, ZkError> {
        let path = Self::state_path(tenant);
        let data = serde_json::to_vec(&state).map_err(|e| ZkError::Other(e.to_string()))?;

        match self.client.exists(&path).await? {
            Some(stat) => {
                self.client.set(&path, &data, stat.version).await?;
            }
            None => {
                self.client.create(&path, &data, false, false).await?;
            }
        }

        state.ltime = self.client.ltime().await;
        // Re-persist with the final ltime stamped in, so a reader of the
        // node itself (not just the write's return value) sees it too.
        let stamped = serde_json::to_vec(&state).map_err(|e| ZkError::Other(e.to_string()))?;
        let stat = self.client.exists(&path).await?.expect("just wrote it");
        self.client.set(&path, &stamped, stat.version).await?;

        Ok(state)
    }

    pub async fn get_min_ltimes(&self, tenant: &TenantName) -> Result<BranchCacheMinLtimes, ZkError> {
        let path = Self::min_ltimes_path(tenant);
        match sharded::read(self.client.as_ref(), &path).await {
            Ok(data) if !data.is_empty() => {
                serde_json::from_slice(&data).map_err(|e| ZkError::Other(e.to_string()))
            }
            Ok(_) => Ok(BranchCacheMinLtimes::new()),
            Err(e) if e.is_no_node() => Ok(BranchCacheMinLtimes::new()),
            Err(e) => Err(e),
        }
    }

    /// Records that `project`/`branch`'s cached files are invalid as of
    /// `ltime`; subsequent reconfigures must not trust a cache older than
    /// this ltime for that branch (spec §4.F).
    pub async fn bump_min_ltime(
        &self,
        tenant: &TenantName,
        project: &str,
        branch: &str,
        ltime: i64,
    ) -> Result<(), ZkError> {
        let mut map = self.get_min_ltimes(tenant).await?;
        let entry = map.entry(project.to_string()).or_default();
        let current = entry.entry(branch.to_string()).or_insert(0);
        *current = (*current).max(ltime);

        let path = Self::min_ltimes_path(tenant);
        if self.client.exists(&path).await?.is_none() {
            self.client.create(&path, b"", false, false).await?;
        }
        let data = serde_json::to_vec(&map).map_err(|e| ZkError::Other(e.to_string()))?;
        sharded::write(self.client.as_ref(), &path, &data).await
    }

    /// True iff a cached file for `project`/`branch` read at `cached_ltime`
    /// is still valid (spec §4.F / §4.I).
    pub async fn is_cache_valid(
        &self,
        tenant: &TenantName,
        project: &str,
        branch: &str,
        cached_ltime: i64,
    ) -> Result<bool, ZkError> {
        let map = self.get_min_ltimes(tenant).await?;
        let min = map
            .get(project)
            .and_then(|branches| branches.get(branch))
            .copied()
            .unwrap_or(0);
        Ok(cached_ltime >= min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_zk::MemoryCoordinationClient;

    fn tenant() -> TenantName {
        TenantName::from("t1")
    }

    #[tokio::test]
    async fn get_on_unknown_tenant_is_none() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let store = LayoutStore::new(client);
        assert!(store.get(&tenant()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_stamps_ltime() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let store = LayoutStore::new(client);

        let state = LayoutState {
            uuid: LayoutId::new(),
            ltime: 0,
            hostname: "sched-1".into(),
            last_reconfigured: Utc::now(),
        };
        let written = store.set(&tenant(), state.clone()).await.unwrap();
        assert!(written.ltime > 0);

        let fetched = store.get(&tenant()).await.unwrap().unwrap();
        assert_eq!(fetched.uuid, state.uuid);
        assert_eq!(fetched.ltime, written.ltime);
    }

    #[tokio::test]
    async fn min_ltimes_track_per_project_branch_and_gate_cache_validity() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let store = LayoutStore::new(client);

        assert!(store.is_cache_valid(&tenant(), "org/repo", "main", 5).await.unwrap());

        store.bump_min_ltime(&tenant(), "org/repo", "main", 10).await.unwrap();
        assert!(!store.is_cache_valid(&tenant(), "org/repo", "main", 5).await.unwrap());
        assert!(store.is_cache_valid(&tenant(), "org/repo", "main", 10).await.unwrap());
        assert!(store.is_cache_valid(&tenant(), "org/repo", "stable", 5).await.unwrap());
    }
}
