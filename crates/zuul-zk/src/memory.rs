//! A single-process, in-memory [`CoordinationClient`]. This is the backend
//! used by every test in the workspace and by `zuul-cli`'s standalone mode;
//! a production deployment wires a real ZooKeeper (or etcd) client behind
//! the same trait instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::client::CoordinationClient;
use crate::error::ZkError;
use crate::stat::{NodeStat, SessionId, WatchEvent, WatchEventKind};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    data: Vec<u8>,
    version: i64,
    ctime: chrono::DateTime<Utc>,
    mtime: chrono::DateTime<Utc>,
    ephemeral_owner: Option<SessionId>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Entry>,
    seq_counters: HashMap<String, u64>,
}

fn normalize(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

pub struct MemoryCoordinationClient {
    session: SessionId,
    inner: Arc<Mutex<Tree>>,
    watch_tx: broadcast::Sender<WatchEvent>,
    conn_lost_tx: broadcast::Sender<()>,
    ltime: Arc<AtomicI64>,
}

impl MemoryCoordinationClient {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let (conn_lost_tx, _) = broadcast::channel(16);
        Self {
            session: SessionId::new(),
            inner: Arc::new(Mutex::new(Tree::default())),
            watch_tx,
            conn_lost_tx,
            ltime: Arc::new(AtomicI64::new(0)),
        }
    }

    /// A second handle sharing the same backing tree but a distinct
    /// [`SessionId`], as if a second scheduler process connected to the same
    /// coordination service. Ephemeral nodes created by one handle are
    /// invisible to `expire_session` on the other.
    pub fn new_session(&self) -> Self {
        Self {
            session: SessionId::new(),
            inner: self.inner.clone(),
            watch_tx: self.watch_tx.clone(),
            conn_lost_tx: self.conn_lost_tx.clone(),
            ltime: self.ltime.clone(),
        }
    }

    fn bump_ltime(&self) -> i64 {
        self.ltime.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, path: String, kind: WatchEventKind, data: Option<Vec<u8>>) {
        let _ = self.watch_tx.send(WatchEvent { path, kind, data });
    }
}

impl Default for MemoryCoordinationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinationClient {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        ephemeral: bool,
        sequential: bool,
    ) -> Result<String, ZkError> {
        let path = normalize(path);
        let mut tree = self.inner.lock().await;

        let final_path = if sequential {
            let parent = parent_of(&path).to_string();
            let seq = tree.seq_counters.entry(parent).or_insert(0);
            let assigned = *seq;
            *seq += 1;
            format!("{path}{assigned:010}")
        } else {
            path.clone()
        };

        if tree.nodes.contains_key(&final_path) {
            return Err(ZkError::NodeExists(final_path));
        }

        let parent = parent_of(&final_path);
        if parent != "/" && !tree.nodes.contains_key(parent) {
            return Err(ZkError::NoNode(parent.to_string()));
        }

        let now = Utc::now();
        tree.nodes.insert(
            final_path.clone(),
            Entry {
                data: data.to_vec(),
                version: 0,
                ctime: now,
                mtime: now,
                ephemeral_owner: ephemeral.then_some(self.session),
            },
        );
        drop(tree);

        self.bump_ltime();
        self.notify(final_path.clone(), WatchEventKind::NodeAdded, Some(data.to_vec()));
        Ok(final_path)
    }

    async fn set(&self, path: &str, data: &[u8], version: i64) -> Result<NodeStat, ZkError> {
        let path = normalize(path);
        let mut tree = self.inner.lock().await;
        let entry = tree
            .nodes
            .get_mut(&path)
            .ok_or_else(|| ZkError::NoNode(path.clone()))?;

        if version != -1 && entry.version != version {
            return Err(ZkError::BadVersion {
                path,
                expected: version,
                actual: entry.version,
            });
        }

        entry.data = data.to_vec();
        entry.version += 1;
        entry.mtime = Utc::now();
        let stat = NodeStat {
            version: entry.version,
            ctime: entry.ctime,
            mtime: entry.mtime,
            ephemeral_owner: entry.ephemeral_owner,
            data_length: entry.data.len(),
        };
        drop(tree);

        self.bump_ltime();
        self.notify(path, WatchEventKind::NodeUpdated, Some(data.to_vec()));
        Ok(stat)
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, NodeStat), ZkError> {
        let path = normalize(path);
        let tree = self.inner.lock().await;
        let entry = tree
            .nodes
            .get(&path)
            .ok_or_else(|| ZkError::NoNode(path.clone()))?;
        Ok((
            entry.data.clone(),
            NodeStat {
                version: entry.version,
                ctime: entry.ctime,
                mtime: entry.mtime,
                ephemeral_owner: entry.ephemeral_owner,
                data_length: entry.data.len(),
            },
        ))
    }

    async fn delete(&self, path: &str, version: i64, recursive: bool) -> Result<(), ZkError> {
        let path = normalize(path);
        let mut tree = self.inner.lock().await;
        let entry = tree
            .nodes
            .get(&path)
            .ok_or_else(|| ZkError::NoNode(path.clone()))?;

        if version != -1 && entry.version != version {
            return Err(ZkError::BadVersion {
                path: path.clone(),
                expected: version,
                actual: entry.version,
            });
        }

        let child_prefix = format!("{path}/");
        let has_children = tree.nodes.keys().any(|k| k.starts_with(&child_prefix));
        if has_children && !recursive {
            return Err(ZkError::NotEmpty(path));
        }

        let removed: Vec<String> = if has_children {
            tree.nodes
                .keys()
                .filter(|k| *k == &path || k.starts_with(&child_prefix))
                .cloned()
                .collect()
        } else {
            vec![path.clone()]
        };
        for r in &removed {
            tree.nodes.remove(r);
        }
        drop(tree);

        self.bump_ltime();
        for r in removed {
            self.notify(r, WatchEventKind::NodeRemoved, None);
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        let path = normalize(path);
        let tree = self.inner.lock().await;
        if path != "/" && !tree.nodes.contains_key(&path) {
            return Err(ZkError::NoNode(path));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut names = Vec::new();
        for key in tree.nodes.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.push(rest.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, ZkError> {
        let path = normalize(path);
        let tree = self.inner.lock().await;
        Ok(tree.nodes.get(&path).map(|entry| NodeStat {
            version: entry.version,
            ctime: entry.ctime,
            mtime: entry.mtime,
            ephemeral_owner: entry.ephemeral_owner,
            data_length: entry.data.len(),
        }))
    }

    fn watch_tree(&self, path: &str) -> broadcast::Receiver<WatchEvent> {
        let prefix = normalize(path);
        let mut upstream = self.watch_tx.subscribe();
        let (scoped_tx, scoped_rx) = broadcast::channel(WATCH_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(event) => {
                        let matches = event.path == prefix
                            || event.path.starts_with(&format!("{prefix}/"))
                            || prefix == "/";
                        if matches && scoped_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        scoped_rx
    }

    fn connection_lost(&self) -> broadcast::Receiver<()> {
        self.conn_lost_tx.subscribe()
    }

    async fn ltime(&self) -> i64 {
        self.ltime.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    async fn expire_session(&self) {
        let mut tree = self.inner.lock().await;
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, e)| e.ephemeral_owner == Some(self.session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in &owned {
            tree.nodes.remove(path);
        }
        drop(tree);

        for path in owned {
            self.notify(path, WatchEventKind::NodeRemoved, None);
        }
        let _ = self.conn_lost_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let client = MemoryCoordinationClient::new();
        let path = client.create("/foo", b"bar", false, false).await.unwrap();
        assert_eq!(path, "/foo");
        let (data, stat) = client.get("/foo").await.unwrap();
        assert_eq!(data, b"bar");
        assert_eq!(stat.version, 0);
    }

    #[tokio::test]
    async fn sequential_children_get_increasing_suffixes() {
        let client = MemoryCoordinationClient::new();
        client.create("/queue", b"", false, false).await.unwrap();
        let a = client
            .create("/queue/item-", b"1", false, true)
            .await
            .unwrap();
        let b = client
            .create("/queue/item-", b"2", false, true)
            .await
            .unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn set_with_stale_version_is_rejected() {
        let client = MemoryCoordinationClient::new();
        client.create("/foo", b"v1", false, false).await.unwrap();
        client.set("/foo", b"v2", 0).await.unwrap();
        let err = client.set("/foo", b"v3", 0).await.unwrap_err();
        assert!(matches!(err, ZkError::BadVersion { .. }));
    }

    #[tokio::test]
    async fn delete_missing_node_is_no_node() {
        let client = MemoryCoordinationClient::new();
        let err = client.delete("/missing", -1, false).await.unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn expire_session_drops_only_that_sessions_ephemeral_nodes() {
        let client_a = MemoryCoordinationClient::new();
        let client_b = client_a.new_session();

        client_a
            .create("/components", b"", false, false)
            .await
            .unwrap();
        client_a
            .create("/components/a", b"", true, false)
            .await
            .unwrap();
        client_b
            .create("/components/b", b"", true, false)
            .await
            .unwrap();

        client_a.expire_session().await;

        assert!(client_a.exists("/components/a").await.unwrap().is_none());
        assert!(client_b.exists("/components/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_tree_scopes_to_subtree_prefix() {
        let client = MemoryCoordinationClient::new();
        client.create("/a", b"", false, false).await.unwrap();
        client.create("/b", b"", false, false).await.unwrap();
        let mut rx = client.watch_tree("/a");

        client.set("/a", b"x", 0).await.unwrap();
        client.set("/b", b"y", 0).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/a");
    }
}
