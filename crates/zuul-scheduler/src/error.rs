//! Scheduler-level error taxonomy (spec §7). Library-internal failures are
//! matched on through this enum; `anyhow` only shows up at the process
//! boundary (the command socket handler, the binary's `main`).

use thiserror::Error;
use zuul_manager::ManagerError;
use zuul_nodepool::NodepoolError;
use zuul_semaphore::SemaphoreError;
use zuul_zk::ZkError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Zk(#[from] ZkError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Nodepool(#[from] NodepoolError),
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),
    #[error("tenant {0:?} is not loaded")]
    UnknownTenant(String),
    #[error("pipeline {0:?} is not configured for tenant {1:?}")]
    UnknownPipeline(String, String),
    #[error("queue {0:?} does not exist in pipeline {1:?}")]
    UnknownQueue(String, String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
