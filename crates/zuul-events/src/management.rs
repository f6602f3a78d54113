//! Management events additionally support an idempotent merge pass over a
//! polled batch (consecutive `TenantReconfigure`s for the same tenant
//! collapse) and an optional result future a caller can await (spec §4.B).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use zuul_types::{AckRef, Event, ManagementEvent};
use zuul_zk::{CoordinationClient, ZkError};

use crate::queue::EventQueue;

pub struct ManagementEventQueue {
    inner: EventQueue<ManagementEvent>,
    client: Arc<dyn CoordinationClient>,
}

impl ManagementEventQueue {
    pub fn new(client: Arc<dyn CoordinationClient>, root: impl Into<String>) -> Self {
        Self {
            inner: EventQueue::new(client.clone(), root),
            client,
        }
    }

    pub async fn ensure_root(&self) -> Result<(), ZkError> {
        self.inner.ensure_root().await
    }

    pub async fn enqueue(&self, event: &ManagementEvent) -> Result<String, ZkError> {
        self.inner.enqueue(event).await
    }

    /// Enqueues `event` and blocks until the consumer writes back a sibling
    /// `<path>-result` node (or `timeout` elapses), returning its contents —
    /// empty means success, non-empty carries a traceback (spec §4.B).
    pub async fn enqueue_and_wait(
        &self,
        event: &ManagementEvent,
        timeout: Duration,
    ) -> Result<String, ZkError> {
        let path = self.inner.enqueue(event).await?;
        let result_path = format!("{path}-result");
        let mut watch = self.client.watch_tree(&result_path);

        if let Ok((data, _)) = self.client.get(&result_path).await {
            return Ok(String::from_utf8_lossy(&data).into_owned());
        }

        tokio::time::timeout(timeout, async {
            loop {
                if watch.recv().await.is_err() {
                    break;
                }
                if let Ok((data, _)) = self.client.get(&result_path).await {
                    return String::from_utf8_lossy(&data).into_owned();
                }
            }
            String::new()
        })
        .await
        .map_err(|_| ZkError::LockTimeout(result_path))
    }

    /// Writes the sibling result node a producer waiting in
    /// [`enqueue_and_wait`] is watching for.
    pub async fn respond(&self, ack_ref: &AckRef, traceback: &str) -> Result<(), ZkError> {
        let result_path = format!("{}-result", ack_ref.path);
        self.client
            .create(&result_path, traceback.as_bytes(), true, false)
            .await?;
        Ok(())
    }

    pub async fn ack(&self, ack_ref: &AckRef) -> Result<(), ZkError> {
        self.inner.ack(ack_ref).await
    }

    pub async fn depth(&self) -> Result<usize, ZkError> {
        self.inner.depth().await
    }

    /// Polls the queue and merges consecutive `TenantReconfigure` events for
    /// the same tenant: the earlier event absorbs the later one's
    /// project/branch set, and the later event is ack'd immediately with an
    /// empty traceback so its producer (if waiting) unblocks without a
    /// second reconfigure ever running.
    pub async fn poll_merged(&self) -> Result<Vec<Event<ManagementEvent>>, ZkError> {
        let batch = self.inner.poll().await?;
        let mut merged: Vec<Event<ManagementEvent>> = Vec::with_capacity(batch.len());

        for event in batch {
            let absorbed = merged.iter_mut().rev().find(|prior| {
                matches!(
                    (&prior.payload.merge_key(), &event.payload.merge_key()),
                    (Some(a), Some(b)) if a == b
                )
            });

            match absorbed {
                Some(prior) => {
                    debug!(path = %event.ack_ref.path, "merging into prior tenant-reconfigure");
                    prior.payload.merge_from(event.payload);
                    self.respond(&event.ack_ref, "").await.ok();
                    self.ack(&event.ack_ref).await?;
                }
                None => merged.push(event),
            }
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_types::TenantName;
    use zuul_zk::MemoryCoordinationClient;

    fn reconfigure(tenant: &str, project: &str, branch: &str) -> ManagementEvent {
        ManagementEvent::TenantReconfigure {
            tenant: TenantName::from(tenant),
            project_branches: vec![(project.into(), branch.into())],
        }
    }

    #[tokio::test]
    async fn consecutive_tenant_reconfigures_merge_into_one() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let q = ManagementEventQueue::new(client, "/events/management");
        q.ensure_root().await.unwrap();

        q.enqueue(&reconfigure("t1", "proj-a", "main")).await.unwrap();
        q.enqueue(&reconfigure("t1", "proj-b", "main")).await.unwrap();
        q.enqueue(&reconfigure("t2", "proj-c", "main")).await.unwrap();

        let merged = q.poll_merged().await.unwrap();
        assert_eq!(merged.len(), 2);
        match &merged[0].payload {
            ManagementEvent::TenantReconfigure {
                project_branches, ..
            } => assert_eq!(project_branches.len(), 2),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn enqueue_and_wait_unblocks_on_respond() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let q = Arc::new(ManagementEventQueue::new(client, "/events/management"));
        q.ensure_root().await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.enqueue_and_wait(&reconfigure("t1", "p", "main"), Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let events = q.poll_merged().await.unwrap();
        q.respond(&events[0].ack_ref, "").await.unwrap();
        q.ack(&events[0].ack_ref).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, "");
    }
}
