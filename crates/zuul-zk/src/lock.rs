//! Session-scoped distributed locks built from ephemeral sequential nodes —
//! the standard recipe: each contender creates `{lock_root}/lock-NNNNNNNNNN`,
//! and holds the lock once its own child is the lowest-numbered sibling
//! (spec §4.A: "locks must be session-scoped so crash releases them").

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::client::CoordinationClient;
use crate::error::ZkError;
use crate::stat::WatchEventKind;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct LockHandle {
    client: Arc<dyn CoordinationClient>,
    path: String,
}

impl LockHandle {
    /// Idempotent: releasing an already-released (or session-expired) lock
    /// is a no-op, matching the `NoNodeError` "already gone" treatment used
    /// for event acks (spec §7).
    pub async fn release(&self) -> Result<(), ZkError> {
        match self.client.delete(&self.path, -1, false).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_node() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Blocks (async) until this contender's ephemeral sequential child is the
/// lowest-numbered sibling under `lock_root`, or `timeout` elapses.
///
/// `lock_root` must already exist as a regular node; callers create it
/// lazily alongside the resource it guards (a semaphore, a pipeline, a
/// tenant) the first time anyone locks it.
pub async fn acquire(
    client: Arc<dyn CoordinationClient>,
    lock_root: &str,
    timeout: Option<Duration>,
) -> Result<LockHandle, ZkError> {
    if client.exists(lock_root).await?.is_none() {
        match client.create(lock_root, b"", false, false).await {
            Ok(_) | Err(ZkError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let my_path = client
        .create(&format!("{lock_root}/lock-"), b"", true, true)
        .await?;
    let my_name = child_name(&my_path);

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut lost = client.connection_lost();

    loop {
        let siblings = client.children(lock_root).await?;
        let lowest = siblings.iter().min();

        if lowest.is_some_and(|s| *s == my_name) {
            debug!(path = %my_path, "lock acquired");
            return Ok(LockHandle {
                client,
                path: my_path,
            });
        }

        if let Ok(()) = lost.try_recv() {
            return Err(ZkError::ConnectionLost);
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = client.delete(&my_path, -1, false).await;
                return Err(ZkError::LockTimeout(lock_root.to_string()));
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Like [`acquire`] but reacts to tree-watch events instead of polling,
/// falling back to a short poll interval so a missed watch event (the
/// in-memory backend never drops one, but a networked backend might) can't
/// wedge the wait forever.
pub async fn acquire_watched(
    client: Arc<dyn CoordinationClient>,
    lock_root: &str,
    timeout: Option<Duration>,
) -> Result<LockHandle, ZkError> {
    if client.exists(lock_root).await?.is_none() {
        match client.create(lock_root, b"", false, false).await {
            Ok(_) | Err(ZkError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let my_path = client
        .create(&format!("{lock_root}/lock-"), b"", true, true)
        .await?;
    let my_name = child_name(&my_path);
    let mut watch = client.watch_tree(lock_root);
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let siblings = client.children(lock_root).await?;
        let lowest = siblings.iter().min();
        if lowest.is_some_and(|s| *s == my_name) {
            return Ok(LockHandle {
                client,
                path: my_path,
            });
        }

        let remaining = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    let _ = client.delete(&my_path, -1, false).await;
                    return Err(ZkError::LockTimeout(lock_root.to_string()));
                }
                Some(d - now)
            }
            None => None,
        };

        let wait = async {
            loop {
                match watch.recv().await {
                    Ok(event) if event.kind == WatchEventKind::NodeRemoved => return,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        };

        match remaining {
            Some(remaining) => {
                let _ = tokio::time::timeout(remaining.min(POLL_INTERVAL * 50), wait).await;
            }
            None => {
                tokio::time::timeout(POLL_INTERVAL * 50, wait).await.ok();
            }
        }
    }
}

fn child_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinationClient;

    #[tokio::test]
    async fn second_contender_waits_for_first_release() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let lock1 = acquire(client.clone(), "/locks/res", None).await.unwrap();

        let client2 = client.clone();
        let waiter = tokio::spawn(async move {
            acquire(client2, "/locks/res", Some(Duration::from_secs(2))).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        lock1.release().await.unwrap();

        let lock2 = waiter.await.unwrap().unwrap();
        assert!(lock2.path().contains("lock-"));
    }

    #[tokio::test]
    async fn timeout_fails_fast_when_held() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let _lock1 = acquire(client.clone(), "/locks/res", None).await.unwrap();

        let err = acquire(client, "/locks/res", Some(Duration::from_millis(80)))
            .await
            .unwrap_err();
        assert!(matches!(err, ZkError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let client: Arc<dyn CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let lock = acquire(client, "/locks/res", None).await.unwrap();
        lock.release().await.unwrap();
        lock.release().await.unwrap();
    }
}
