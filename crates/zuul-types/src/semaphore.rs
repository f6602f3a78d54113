//! Tenant-scoped named counted semaphores (spec §4.E).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Semaphore {
    pub name: String,
    pub max_count: u32,
    /// Handle paths currently holding the semaphore, `"{item_uuid}-{job_name}"`.
    pub holders: Vec<String>,
    /// If set, a holder acquired during the node-request phase returns
    /// immediately without taking a slot, deferring the real acquire to the
    /// launch phase (spec §4.E).
    pub resources_first: bool,
}

impl Semaphore {
    pub fn new(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            name: name.into(),
            max_count,
            holders: Vec::new(),
            resources_first: false,
        }
    }

    pub fn has_capacity(&self) -> bool {
        (self.holders.len() as u32) < self.max_count
    }
}

/// `(item_uuid, job_name)` identifying one potential holder of a semaphore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreHandle {
    pub item: crate::ids::ItemId,
    pub job_name: String,
}

impl SemaphoreHandle {
    pub fn path_segment(&self) -> String {
        format!("{}-{}", self.item, self.job_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_respects_max_count() {
        let mut sem = Semaphore::new("db-migration", 1);
        assert!(sem.has_capacity());
        sem.holders.push("a-job1".into());
        assert!(!sem.has_capacity());
    }
}
