//! Tenant-scoped named counted semaphores (spec §4.E): a job can declare it
//! needs a named semaphore, and at most `max-count` jobs may hold the same
//! semaphore at once across every pipeline in a tenant. `|holders(s)| <=
//! max(s)` must hold at every observation (spec §8 invariant); this crate's
//! job is to make every acquire/release transactional against the
//! coordination store so that invariant survives concurrent schedulers.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use zuul_types::{ItemId, Semaphore, SemaphoreHandle, TenantName};
use zuul_zk::{lock, CoordinationClient, ZkError};

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error(transparent)]
    Zk(#[from] ZkError),
    #[error("{0}")]
    Serde(String),
}

/// Which phase of a job's lifecycle is asking for the semaphore — the
/// distinction matters only when `resources_first` is set (spec §4.E: "a
/// holder acquired during the node-request phase returns immediately
/// without taking a slot, deferring the real acquire to the launch phase").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePhase {
    NodeRequest,
    Launch,
}

pub struct SemaphoreHandler {
    client: Arc<dyn CoordinationClient>,
    tenant: TenantName,
}

impl SemaphoreHandler {
    pub fn new(client: Arc<dyn CoordinationClient>, tenant: TenantName) -> Self {
        Self { client, tenant }
    }

    fn path(&self, name: &str) -> String {
        format!("/semaphores/{}/{name}", self.tenant)
    }

    fn lock_path(&self, name: &str) -> String {
        format!("{}/lock", self.path(name))
    }

    /// Creates every ancestor of `{name}`'s own node in order, since the
    /// store (unlike a filesystem) refuses a create whose parent is missing.
    async fn ensure_parent(&self, name: &str) -> Result<(), SemaphoreError> {
        for path in ["/semaphores".to_string(), format!("/semaphores/{}", self.tenant), self.path(name)] {
            if self.client.exists(&path).await?.is_none() {
                match self.client.create(&path, b"", false, false).await {
                    Ok(_) | Err(ZkError::NodeExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn read(&self, name: &str, max_count: u32, resources_first: bool) -> Result<Semaphore, SemaphoreError> {
        let data_path = format!("{}/state", self.path(name));
        match self.client.get(&data_path).await {
            Ok((data, _)) => {
                serde_json::from_slice(&data).map_err(|e| SemaphoreError::Serde(e.to_string()))
            }
            Err(e) if e.is_no_node() => {
                let mut sem = Semaphore::new(name, max_count);
                sem.resources_first = resources_first;
                Ok(sem)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, sem: &Semaphore) -> Result<(), SemaphoreError> {
        let data_path = format!("{}/state", self.path(name));
        let data = serde_json::to_vec(sem).map_err(|e| SemaphoreError::Serde(e.to_string()))?;
        match self.client.exists(&data_path).await? {
            Some(stat) => {
                self.client.set(&data_path, &data, stat.version).await?;
            }
            None => {
                self.client.create(&data_path, &data, false, false).await?;
            }
        }
        Ok(())
    }

    /// Attempts to take a slot for `handle`. Returns `Ok(true)` if the slot
    /// was taken (or bypassed under `resources_first` during the
    /// node-request phase), `Ok(false)` if the semaphore is full and the
    /// caller must retry on a later pass — this never blocks, matching the
    /// spec's "the manager's processing pass, not this call, owns waiting."
    pub async fn acquire(
        &self,
        name: &str,
        max_count: u32,
        resources_first: bool,
        phase: AcquirePhase,
        handle: SemaphoreHandle,
    ) -> Result<bool, SemaphoreError> {
        if resources_first && phase == AcquirePhase::NodeRequest {
            debug!(semaphore = name, "resources-first bypass at node-request phase");
            return Ok(true);
        }

        self.ensure_parent(name).await?;
        let lock = lock::acquire(self.client.clone(), &self.lock_path(name), None).await?;

        let mut sem = self.read(name, max_count, resources_first).await?;
        let segment = handle.path_segment();
        if sem.holders.contains(&segment) {
            lock.release().await?;
            return Ok(true);
        }

        if !sem.has_capacity() {
            lock.release().await?;
            return Ok(false);
        }

        sem.holders.push(segment);
        self.write(name, &sem).await?;
        lock.release().await?;
        Ok(true)
    }

    /// Idempotent: releasing a handle that never took (or already gave up)
    /// its slot is a no-op (spec §7 `NoNodeError`-as-"already gone" pattern).
    pub async fn release(&self, name: &str, handle: &SemaphoreHandle) -> Result<(), SemaphoreError> {
        self.ensure_parent(name).await?;
        let lock = lock::acquire(self.client.clone(), &self.lock_path(name), None).await?;

        let mut sem = self.read(name, 1, false).await?;
        let segment = handle.path_segment();
        let before = sem.holders.len();
        sem.holders.retain(|h| *h != segment);
        if sem.holders.len() != before {
            self.write(name, &sem).await?;
        }

        lock.release().await
    }

    /// Drops any holder whose item is no longer live in this tenant: an item
    /// can be removed from a queue (promoted out, dequeued) between
    /// acquiring and releasing a semaphore if its scheduler crashes first, and
    /// nothing else will ever call `release` for it (spec §4.E cleanup task).
    pub async fn cleanup_leaks(&self, live_items: &HashSet<ItemId>) -> Result<Vec<String>, SemaphoreError> {
        let mut removed = Vec::new();
        let tenant_path = format!("/semaphores/{}", self.tenant);
        let names = match self.client.children(&tenant_path).await {
            Ok(v) => v,
            Err(e) if e.is_no_node() => return Ok(removed),
            Err(e) => return Err(e.into()),
        };

        for name in names {
            let lock = lock::acquire(self.client.clone(), &self.lock_path(&name), None).await?;
            let mut sem = self.read(&name, 1, false).await?;
            let before = sem.holders.len();
            sem.holders.retain(|h| {
                // A handle segment is "{item-uuid}-{job_name}"; a UUID's
                // canonical form is always 36 characters, so slicing there
                // (rather than splitting on '-', which also appears inside
                // the UUID itself) is the only reliable way to recover it.
                let keep = h
                    .get(..36)
                    .and_then(|item_str| item_str.parse::<uuid::Uuid>().ok())
                    .map(|uuid| live_items.contains(&ItemId(uuid)))
                    .unwrap_or(true);
                if !keep {
                    removed.push(format!("{name}:{h}"));
                }
                keep
            });
            if sem.holders.len() != before {
                self.write(&name, &sem).await?;
                warn!(semaphore = %name, dropped = before - sem.holders.len(), "cleaned up leaked semaphore holders");
            }
            lock.release().await?;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_zk::MemoryCoordinationClient;

    fn handler() -> SemaphoreHandler {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        SemaphoreHandler::new(client, TenantName::from("t1"))
    }

    fn holder(item: ItemId) -> SemaphoreHandle {
        SemaphoreHandle {
            item,
            job_name: "db-migrate".into(),
        }
    }

    #[tokio::test]
    async fn acquire_respects_max_count() {
        let h = handler();
        let a = holder(ItemId::new());
        let b = holder(ItemId::new());

        assert!(h.acquire("db", 1, false, AcquirePhase::Launch, a.clone()).await.unwrap());
        assert!(!h.acquire("db", 1, false, AcquirePhase::Launch, b.clone()).await.unwrap());

        h.release("db", &a).await.unwrap();
        assert!(h.acquire("db", 1, false, AcquirePhase::Launch, b).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_is_idempotent_for_the_same_holder() {
        let h = handler();
        let a = holder(ItemId::new());
        assert!(h.acquire("db", 1, false, AcquirePhase::Launch, a.clone()).await.unwrap());
        assert!(h.acquire("db", 1, false, AcquirePhase::Launch, a).await.unwrap());
    }

    #[tokio::test]
    async fn resources_first_bypasses_node_request_phase_but_not_launch() {
        let h = handler();
        let a = holder(ItemId::new());
        let b = holder(ItemId::new());

        assert!(h.acquire("db", 1, true, AcquirePhase::NodeRequest, a.clone()).await.unwrap());
        assert!(h.acquire("db", 1, true, AcquirePhase::NodeRequest, b.clone()).await.unwrap());

        assert!(h.acquire("db", 1, true, AcquirePhase::Launch, a).await.unwrap());
        assert!(!h.acquire("db", 1, true, AcquirePhase::Launch, b).await.unwrap());
    }

    #[tokio::test]
    async fn release_of_unheld_handle_is_a_noop() {
        let h = handler();
        let a = holder(ItemId::new());
        h.release("db", &a).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_leaks_drops_holders_for_items_no_longer_live() {
        let h = handler();
        let live = ItemId::new();
        let gone = ItemId::new();

        h.acquire("db", 2, false, AcquirePhase::Launch, holder(live))
            .await
            .unwrap();
        h.acquire("db", 2, false, AcquirePhase::Launch, holder(gone))
            .await
            .unwrap();

        let mut live_items = HashSet::new();
        live_items.insert(live);
        let removed = h.cleanup_leaks(&live_items).await.unwrap();
        assert_eq!(removed.len(), 1);

        assert!(h
            .acquire("db", 2, false, AcquirePhase::Launch, holder(ItemId::new()))
            .await
            .unwrap());
    }
}
