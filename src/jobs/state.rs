use std::time::Duration;

use chrono::Utc;

use super::job::{Job, JobOutcome, JobStatus, TaskFailure};

/// The result of applying an outcome to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Succeeded,
    /// Retryable failure; the job goes back to its queue after `delay`.
    Retry {
        attempt: u32,
        delay: Duration,
        reason: TaskFailure,
    },
    Failed(TaskFailure),
    /// The job was already terminal; nothing changed.
    Unchanged,
}

/// Drives a `Job` through PENDING → STARTED → (RETRY → STARTED)* → SUCCESS | FAILURE.
pub struct StateMachine;

impl StateMachine {
    /// Marks a job as picked up by a worker. Returns false for terminal jobs.
    pub fn start(job: &mut Job) -> bool {
        if job.status.is_terminal() {
            return false;
        }
        Self::set_status(job, JobStatus::Started);
        true
    }

    /// Computes and applies the transition for `outcome`.
    ///
    /// - Success is terminal and stores the result.
    /// - A retryable failure with retries left moves to `Retry`.
    /// - Anything else is a terminal `Failure` carrying the last error.
    /// - Terminal jobs never change again.
    pub fn next(job: &mut Job, outcome: JobOutcome) -> Transition {
        if job.status.is_terminal() {
            return Transition::Unchanged;
        }

        match outcome {
            JobOutcome::Success(value) => {
                job.result = Some(value);
                job.error = None;
                Self::set_status(job, JobStatus::Success);
                Transition::Succeeded
            }
            JobOutcome::Failure(err) => {
                let reason = TaskFailure::from(&err);
                job.error = Some(reason.clone());
                if err.is_retryable() && job.retry_count < job.spec.max_retries {
                    job.retry_count += 1;
                    Self::set_status(job, JobStatus::Retry);
                    Transition::Retry {
                        attempt: job.retry_count,
                        delay: job.spec.backoff.delay_for_attempt(job.retry_count),
                        reason,
                    }
                } else {
                    Self::set_status(job, JobStatus::Failure);
                    Transition::Failed(reason)
                }
            }
        }
    }

    fn set_status(job: &mut Job, status: JobStatus) {
        job.status_history.push(job.status);
        job.status = status;
        job.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TaskError};
    use crate::jobs::job::{Backoff, JobKind, JobSpec};

    fn make_job(max_retries: u32) -> Job {
        Job::new(
            "generate".into(),
            "default".into(),
            JobKind::Generate { metadata_id: 1 },
            JobSpec {
                max_retries,
                backoff: Backoff {
                    base_delay_ms: 100,
                    max_delay_ms: 1000,
                },
                ..Default::default()
            },
        )
    }

    fn transient() -> JobOutcome {
        JobOutcome::Failure(TaskError::Transient("disk busy".into()))
    }

    #[test]
    fn happy_path() {
        let mut job = make_job(3);
        assert!(StateMachine::start(&mut job));
        assert_eq!(job.status, JobStatus::Started);

        let t = StateMachine::next(&mut job, JobOutcome::Success(serde_json::json!({"id": 1})));
        assert_eq!(t, Transition::Succeeded);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.result, Some(serde_json::json!({"id": 1})));
        assert_eq!(job.status_history, vec![JobStatus::Pending, JobStatus::Started]);
    }

    #[test]
    fn transient_failure_retries_then_fails() {
        let mut job = make_job(2);

        StateMachine::start(&mut job);
        let t = StateMachine::next(&mut job, transient());
        assert!(matches!(t, Transition::Retry { attempt: 1, .. }));
        assert_eq!(job.status, JobStatus::Retry);

        StateMachine::start(&mut job);
        let t = StateMachine::next(&mut job, transient());
        match t {
            Transition::Retry { attempt, delay, .. } => {
                assert_eq!(attempt, 2);
                assert_eq!(delay, Duration::from_millis(200));
            }
            other => panic!("unexpected {other:?}"),
        }

        StateMachine::start(&mut job);
        let t = StateMachine::next(&mut job, transient());
        assert!(matches!(t, Transition::Failed(ref f) if f.error == ErrorKind::Transient));
        assert_eq!(job.status, JobStatus::Failure);
        assert_eq!(job.retry_count, 2);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let mut job = make_job(5);
        StateMachine::start(&mut job);
        let t = StateMachine::next(
            &mut job,
            JobOutcome::Failure(TaskError::UnsupportedFormat("usdz".into())),
        );
        assert!(matches!(t, Transition::Failed(_)));
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error.as_ref().map(|e| e.error), Some(ErrorKind::UnsupportedFormat));
    }

    #[test]
    fn zero_retries_fails_immediately() {
        let mut job = make_job(0);
        StateMachine::start(&mut job);
        assert!(matches!(StateMachine::next(&mut job, transient()), Transition::Failed(_)));
    }

    #[test]
    fn retry_then_succeed_clears_error() {
        let mut job = make_job(3);
        StateMachine::start(&mut job);
        StateMachine::next(&mut job, transient());
        assert!(job.error.is_some());

        StateMachine::start(&mut job);
        StateMachine::next(&mut job, JobOutcome::Success(serde_json::Value::Null));
        assert_eq!(job.status, JobStatus::Success);
        assert!(job.error.is_none());
        assert_eq!(
            job.status_history,
            vec![
                JobStatus::Pending,
                JobStatus::Started,
                JobStatus::Retry,
                JobStatus::Started
            ]
        );
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut job = make_job(3);
        StateMachine::start(&mut job);
        StateMachine::next(&mut job, JobOutcome::Success(serde_json::Value::Null));

        assert!(!StateMachine::start(&mut job));
        assert_eq!(StateMachine::next(&mut job, transient()), Transition::Unchanged);
        assert_eq!(job.status, JobStatus::Success);
    }
}
