use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the CS client session that owns a node's ephemeral lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata returned alongside a node's data; `version` is the optimistic
/// concurrency token every write must present (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub version: i64,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ephemeral_owner: Option<SessionId>,
    pub data_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeAdded,
    NodeUpdated,
    NodeRemoved,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
    pub data: Option<Vec<u8>>,
}
