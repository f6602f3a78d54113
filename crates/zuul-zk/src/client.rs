use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ZkError;
use crate::stat::{NodeStat, SessionId, WatchEvent};

/// A hierarchical ephemeral-node-capable key/value + watch service
/// (ZooKeeper-like). Every crate above this one talks to shared scheduler
/// state exclusively through this trait — it is the one seam where the
/// process boundary with the coordination service lives (spec §4.A).
///
/// Modeled as a trait with a production backend left to the deployer (an
/// etcd or a real ZooKeeper client) and an in-memory reference backend here
/// for tests and single-scheduler operation, the same shape as a
/// `KeyValueStore` abstraction over pluggable cluster-state backends.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Creates `path` with `data`. If `sequential`, a monotonic zero-padded
    /// suffix is appended and the resulting path returned; the caller must
    /// not assume `path` is the final path in that case.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        ephemeral: bool,
        sequential: bool,
    ) -> Result<String, ZkError>;

    async fn set(&self, path: &str, data: &[u8], version: i64) -> Result<NodeStat, ZkError>;

    async fn get(&self, path: &str) -> Result<(Vec<u8>, NodeStat), ZkError>;

    /// `version == -1` means "any version" (unconditional delete), mirroring
    /// the ZooKeeper convention.
    async fn delete(&self, path: &str, version: i64, recursive: bool) -> Result<(), ZkError>;

    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError>;

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, ZkError>;

    /// Subtree watch: yields `NodeAdded`/`NodeUpdated`/`NodeRemoved` for any
    /// path under (or equal to) `path`. Must survive transient disconnects —
    /// the in-memory backend never disconnects, so this always holds here;
    /// a networked backend would have to resubscribe under the hood.
    fn watch_tree(&self, path: &str) -> broadcast::Receiver<WatchEvent>;

    /// Fires once when this client's session is declared lost. All lock and
    /// ephemeral-node holders must treat themselves as released the moment
    /// this fires (spec §4.A, §8 "session loss").
    fn connection_lost(&self) -> broadcast::Receiver<()>;

    /// The store's global transaction counter, used to order reconfiguration
    /// events and validate file caches across reconfigures (spec §9 `Ltime`).
    async fn ltime(&self) -> i64;

    fn session_id(&self) -> SessionId;

    /// Test/ops hook: simulate this client's session dying. Drops every
    /// ephemeral node it owns and fires `connection_lost`.
    async fn expire_session(&self);
}
