use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use zuul_types::{AckRef, Event, ResultEvent, TriggerEvent};
use zuul_zk::{CoordinationClient, ZkError};

/// A sequential-node queue holding `T` payloads under `root`. Dequeue order
/// is CS child-name order, which is creation order since names are
/// zero-padded monotonic sequence numbers.
pub struct EventQueue<T> {
    client: Arc<dyn CoordinationClient>,
    root: String,
    _payload: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync> EventQueue<T> {
    pub fn new(client: Arc<dyn CoordinationClient>, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into(),
            _payload: PhantomData,
        }
    }

    pub async fn ensure_root(&self) -> Result<(), ZkError> {
        if self.client.exists(&self.root).await?.is_none() {
            match self.client.create(&self.root, b"", false, false).await {
                Ok(_) | Err(ZkError::NodeExists(_)) => Ok(()),
                Err(e) => Err(e),
            }?;
        }
        Ok(())
    }

    pub async fn enqueue(&self, payload: &T) -> Result<String, ZkError> {
        let data = serde_json::to_vec(payload).map_err(|e| ZkError::Other(e.to_string()))?;
        self.client
            .create(&format!("{}/event-", self.root), &data, false, true)
            .await
    }

    /// Returns queued events in FIFO order, each tagged with the [`AckRef`]
    /// needed to remove it. Does not delete anything — at-least-once
    /// delivery means a crash between `poll` and `ack` redelivers the event,
    /// so handlers must be idempotent (spec §7, §8).
    pub async fn poll(&self) -> Result<Vec<Event<T>>, ZkError> {
        let mut names = self.client.children(&self.root).await?;
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let path = format!("{}/{name}", self.root);
            match self.client.get(&path).await {
                Ok((data, stat)) => {
                    let payload: T = match serde_json::from_slice(&data) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(path = %path, error = %e, "dropping unparseable event");
                            continue;
                        }
                    };
                    out.push(Event {
                        payload,
                        ack_ref: AckRef::new(path, stat.version),
                        enqueued_at: Utc::now(),
                    });
                }
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Child count under `root`, for queue-depth metrics (spec §4.K) —
    /// cheaper than `poll` since it skips fetching and parsing payloads.
    pub async fn depth(&self) -> Result<usize, ZkError> {
        match self.client.children(&self.root).await {
            Ok(names) => Ok(names.len()),
            Err(e) if e.is_no_node() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// A `NoNodeError` here means someone else already acked (or the
    /// session that wrote it died and it was never really there) — treated
    /// as success, not a fatal error (spec §7).
    pub async fn ack(&self, ack_ref: &AckRef) -> Result<(), ZkError> {
        match self
            .client
            .delete(&ack_ref.path, ack_ref.version, false)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_node() => {
                warn!(path = %ack_ref.path, "ack on already-removed event");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

pub type TriggerEventQueue = EventQueue<TriggerEvent>;
pub type ResultEventQueue = EventQueue<ResultEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use zuul_types::TenantName;
    use zuul_zk::MemoryCoordinationClient;

    fn sample_trigger() -> TriggerEvent {
        TriggerEvent {
            tenant: TenantName::from("t1"),
            project: "org/repo".into(),
            branch: Some("main".into()),
            change: "123,1".into(),
            trigger_name: "patchset-created".into(),
            payload: serde_json::json!({}),
            zuul_event_ltime: 1,
            min_reconfigure_ltime: 0,
            branch_cache_ltime: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_poll_preserves_order() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let q: TriggerEventQueue = EventQueue::new(client, "/events/trigger");
        q.ensure_root().await.unwrap();

        let mut e1 = sample_trigger();
        e1.change = "1,1".into();
        let mut e2 = sample_trigger();
        e2.change = "2,1".into();
        q.enqueue(&e1).await.unwrap();
        q.enqueue(&e2).await.unwrap();

        let polled = q.poll().await.unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].payload.change, "1,1");
        assert_eq!(polled[1].payload.change, "2,1");
    }

    #[tokio::test]
    async fn ack_removes_event_and_is_idempotent() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let q: TriggerEventQueue = EventQueue::new(client, "/events/trigger");
        q.ensure_root().await.unwrap();
        q.enqueue(&sample_trigger()).await.unwrap();

        let polled = q.poll().await.unwrap();
        assert_eq!(polled.len(), 1);
        q.ack(&polled[0].ack_ref).await.unwrap();
        q.ack(&polled[0].ack_ref).await.unwrap();

        assert!(q.poll().await.unwrap().is_empty());
    }
}
