//! One execution of one job (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::BuildId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Failure,
    Aborted,
    MergeConflict,
    RetryLimit,
    PostFailure,
    DiskFull,
    NodeFailure,
    TimedOut,
    Skipped,
    /// Result pending — the build is still running.
    Running,
    /// Interim result while a retryable failure is being retried (spec §7).
    Retry,
}

impl BuildResult {
    /// Results that warrant another attempt, up to `job.attempts` (spec §7).
    /// `MERGER_FAILURE`/`MERGE_CONFLICT` are treated as one recoverable
    /// infrastructure class per the open question in spec §9.
    pub fn is_retryable_infra_failure(&self) -> bool {
        matches!(
            self,
            BuildResult::MergeConflict | BuildResult::NodeFailure | BuildResult::Aborted
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildResult::Running | BuildResult::Retry)
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, BuildResult::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub job_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<BuildResult>,
    pub url: Option<String>,
    pub worker_info: Option<String>,
    pub paused: bool,
    pub held: bool,
    /// Set while an infra failure is being retried; cleared once a terminal
    /// (non-retry) result lands.
    pub retry: bool,
    /// Final once true: spec §8 invariant, no later event may flip the
    /// result of a canceled build.
    pub canceled: bool,
    pub result_data: serde_json::Value,
    pub node_labels: Vec<String>,
    pub node_name: Option<String>,
}

impl Build {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            id: BuildId::new(),
            job_name: job_name.into(),
            start_time: None,
            end_time: None,
            result: None,
            url: None,
            worker_info: None,
            paused: false,
            held: false,
            retry: false,
            canceled: false,
            result_data: serde_json::Value::Null,
            node_labels: Vec::new(),
            node_name: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.result.map(|r| r.is_terminal()).unwrap_or(false) || self.canceled
    }

    /// Apply a completion result, honoring the "canceled is final" invariant
    /// (spec §8): a result arriving for an already-canceled build is dropped.
    pub fn complete(&mut self, result: BuildResult, end_time: DateTime<Utc>) {
        if self.canceled {
            return;
        }
        self.result = Some(result);
        self.end_time = Some(end_time);
        self.retry = matches!(result, BuildResult::Retry);
    }

    pub fn cancel(&mut self) {
        self.canceled = true;
        self.result = Some(BuildResult::Aborted);
        self.end_time = self.end_time.or_else(|| Some(Utc::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_build_is_never_overwritten() {
        let mut b = Build::new("job1");
        b.cancel();
        assert!(b.canceled);
        b.complete(BuildResult::Success, Utc::now());
        assert_eq!(b.result, Some(BuildResult::Aborted));
    }

    #[test]
    fn merge_conflict_and_node_failure_are_both_retryable() {
        assert!(BuildResult::MergeConflict.is_retryable_infra_failure());
        assert!(BuildResult::NodeFailure.is_retryable_infra_failure());
        assert!(!BuildResult::Failure.is_retryable_infra_failure());
    }

    #[test]
    fn build_round_trips_through_json() {
        let mut b = Build::new("job1");
        b.complete(BuildResult::Success, Utc::now());
        let json = serde_json::to_string(&b).unwrap();
        let back: Build = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_name, b.job_name);
        assert_eq!(back.result, b.result);
    }
}
