//! Maps a finished build's result onto "try again" or "this is final"
//! (spec §7: `job.attempts`, `RETRY_LIMIT`).

use zuul_types::BuildResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Final,
}

#[derive(Debug, Clone, Copy)]
pub struct BuildRetryPolicy {
    /// Job-configured ceiling on infra-failure attempts (`job.attempts`).
    pub max_attempts: u32,
}

impl BuildRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// `attempt` counts the build just completed (1-indexed). Only
    /// infrastructure-class failures consume the retry budget; a genuine
    /// test failure is final on the first try.
    pub fn decide(&self, result: BuildResult, attempt: u32) -> RetryDecision {
        if !result.is_retryable_infra_failure() {
            return RetryDecision::Final;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Final;
        }
        RetryDecision::Retry
    }

    /// The result to settle on once retries are exhausted, surfaced to
    /// reporters as `RETRY_LIMIT` rather than the raw infra failure so
    /// operators can tell "gave up retrying" from "failed once".
    pub fn exhausted_result(&self, attempt: u32) -> Option<BuildResult> {
        (attempt >= self.max_attempts).then_some(BuildResult::RetryLimit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genuine_failure_is_never_retried() {
        let policy = BuildRetryPolicy::new(5);
        assert_eq!(
            policy.decide(BuildResult::Failure, 1),
            RetryDecision::Final
        );
    }

    #[test]
    fn node_failure_retries_until_attempts_exhausted() {
        let policy = BuildRetryPolicy::new(3);
        assert_eq!(
            policy.decide(BuildResult::NodeFailure, 1),
            RetryDecision::Retry
        );
        assert_eq!(
            policy.decide(BuildResult::NodeFailure, 2),
            RetryDecision::Retry
        );
        assert_eq!(
            policy.decide(BuildResult::NodeFailure, 3),
            RetryDecision::Final
        );
    }

    #[test]
    fn exhausted_result_is_retry_limit_not_raw_failure() {
        let policy = BuildRetryPolicy::new(2);
        assert_eq!(policy.exhausted_result(1), None);
        assert_eq!(policy.exhausted_result(2), Some(BuildResult::RetryLimit));
    }
}
