//! Retry decision for failed task runs.
//!
//! Stores load the task's retry settings and the run's attempt counter, then
//! defer to `RetryPolicy::should_rerun` so every backend applies the same rule.

use dagrun_types::dag::TaskSpec;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry settings of a task combined with its run's attempt counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt counter of the task run; the first attempt is 1.
    pub attempts: u32,
    pub backoff_limit: u32,
    /// When set, only exit codes listed in `retry_codes` are retried.
    pub conditional: bool,
    pub retry_codes: Vec<i32>,
}

impl RetryPolicy {
    pub fn for_task(task: &TaskSpec, attempts: u32) -> Self {
        Self {
            attempts,
            backoff_limit: task.backoff.limit,
            conditional: task.conditional.enabled,
            retry_codes: task.conditional.retry_codes.clone(),
        }
    }

    /// Whether a unit that exited with `exit_code` should be retried.
    ///
    /// A task with a backoff limit of N gets N retries, i.e. up to N + 1
    /// total attempts.
    pub fn should_rerun(&self, exit_code: i32) -> bool {
        if self.attempts > self.backoff_limit {
            return false;
        }
        !self.conditional || self.retry_codes.contains(&exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::dag::{Backoff, Conditional};

    fn policy(attempts: u32, limit: u32, codes: Option<Vec<i32>>) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff_limit: limit,
            conditional: codes.is_some(),
            retry_codes: codes.unwrap_or_default(),
        }
    }

    #[test]
    fn test_zero_limit_never_retries() {
        assert!(!policy(1, 0, None).should_rerun(1));
    }

    #[test]
    fn test_retries_until_limit() {
        assert!(policy(1, 2, None).should_rerun(1));
        assert!(policy(2, 2, None).should_rerun(1));
        assert!(!policy(3, 2, None).should_rerun(1));
    }

    #[test]
    fn test_conditional_codes() {
        let p = policy(1, 3, Some(vec![3, 4]));
        assert!(p.should_rerun(3));
        assert!(p.should_rerun(4));
        assert!(!p.should_rerun(1));
        assert!(!p.should_rerun(-1));
    }

    #[test]
    fn test_conditional_with_empty_codes_never_retries() {
        assert!(!policy(1, 3, Some(vec![])).should_rerun(1));
    }

    #[test]
    fn test_for_task() {
        let task = TaskSpec {
            name: "t".into(),
            backoff: Backoff { limit: 1 },
            conditional: Conditional {
                enabled: true,
                retry_codes: vec![7],
            },
            ..Default::default()
        };
        let p = RetryPolicy::for_task(&task, 1);
        assert!(p.should_rerun(7));
        assert!(!RetryPolicy::for_task(&task, 2).should_rerun(7));
    }
}
