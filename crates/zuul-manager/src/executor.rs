//! Seam to the job executor (spec §1: execution of jobs on nodes is an
//! external collaborator this workspace does not implement). The manager
//! only needs to ask for a build to start or stop; everything about how a
//! worker actually runs a job lives outside this crate.

use async_trait::async_trait;
use zuul_nodepool::NodeSet;
use zuul_types::{BuildId, ItemId};

#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn submit_build(&self, item: ItemId, job_name: &str, nodes: &NodeSet) -> BuildId;
    async fn cancel_build(&self, build_id: BuildId);
}

/// Records every submit/cancel call it receives — the test double used by
/// this crate's own tests, and by anything downstream that wants to assert
/// "job X was launched" without running a real executor.
#[derive(Default)]
pub struct MemoryExecutorClient {
    submitted: std::sync::Mutex<Vec<(ItemId, String)>>,
    canceled: std::sync::Mutex<Vec<BuildId>>,
}

impl MemoryExecutorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<(ItemId, String)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> Vec<BuildId> {
        self.canceled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutorClient for MemoryExecutorClient {
    async fn submit_build(&self, item: ItemId, job_name: &str, _nodes: &NodeSet) -> BuildId {
        let id = BuildId::new();
        self.submitted.lock().unwrap().push((item, job_name.to_string()));
        id
    }

    async fn cancel_build(&self, build_id: BuildId) {
        self.canceled.lock().unwrap().push(build_id);
    }
}
