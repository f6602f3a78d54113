//! Errors surfaced by the pipeline manager (spec §4.H, §7).

use thiserror::Error;
use zuul_nodepool::NodepoolError;
use zuul_semaphore::SemaphoreError;
use zuul_zk::ZkError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Zk(#[from] ZkError),
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),
    #[error(transparent)]
    Nodepool(#[from] NodepoolError),
    /// A change's declared dependencies form a cycle — refusing to enqueue
    /// rather than looping forever walking changes-ahead (spec §4.H step 1).
    #[error("dependency cycle detected enqueuing {0:?}")]
    DependencyCycle(String),
    /// A change's dependency already sits in a different queue than the one
    /// this change would land in — the two can never merge together.
    #[error("{0:?} depends on {1:?}, which is enqueued in a different queue")]
    CrossQueueDependency(String, String),
}
