use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, TaskError};
use crate::exporter::{Format, RenderParams};
use crate::model::Metadata;

/// Failure recorded on a job, as reported in `task_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error: ErrorKind,
    pub message: String,
}

impl From<&TaskError> for TaskFailure {
    fn from(err: &TaskError) -> Self {
        Self {
            error: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// The result of running a job body once.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure(TaskError),
}

/// Lifecycle status of a job. `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Started => write!(f, "STARTED"),
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Failure => write!(f, "FAILURE"),
            JobStatus::Retry => write!(f, "RETRY"),
        }
    }
}

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 600_000,
        }
    }
}

impl Backoff {
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Routing and retry policy supplied with each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Overrides the queue derived from the task name.
    #[serde(default)]
    pub queue: Option<String>,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            queue: None,
            max_retries: 5,
            backoff: Backoff::default(),
        }
    }
}

/// What a job does when a worker picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Generate {
        metadata_id: u64,
    },
    Render {
        format: Format,
        metadata: Metadata,
        #[serde(default)]
        params: RenderParams,
    },
}

impl JobKind {
    pub fn task_name(&self) -> String {
        match self {
            JobKind::Generate { .. } => "generate".to_string(),
            JobKind::Render { format, .. } => format.task_name(),
        }
    }
}

/// One unit of background work tracked by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task: String,
    pub queue: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub status_history: Vec<JobStatus>,
    pub retry_count: u32,
    pub spec: JobSpec,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(task: String, queue: String, kind: JobKind, spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            queue,
            kind,
            status: JobStatus::Pending,
            status_history: Vec::new(),
            retry_count: 0,
            spec,
            result: None,
            error: None,
            batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `task_result` as reported to clients.
    pub fn task_result(&self) -> serde_json::Value {
        match self.status {
            JobStatus::Success => self.result.clone().unwrap_or(serde_json::Value::Null),
            JobStatus::Failure | JobStatus::Retry => self
                .error
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .unwrap_or(serde_json::Value::Null),
            JobStatus::Pending | JobStatus::Started => serde_json::Value::Null,
        }
    }
}

/// A fixed group of jobs submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub job_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(job_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_ids,
            created_at: Utc::now(),
        }
    }
}

/// Poll response for a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub task_status: JobStatus,
    pub task_result: serde_json::Value,
}

impl TaskInfo {
    pub fn from_job(job: &Job) -> Self {
        Self {
            task_id: job.id.clone(),
            task_status: job.status,
            task_result: job.task_result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_job() -> Job {
        Job::new(
            "generate".into(),
            "default".into(),
            JobKind::Generate { metadata_id: 1 },
            JobSpec::default(),
        )
    }

    #[test]
    fn job_creation_defaults() {
        let job = generate_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.spec.max_retries, 5);
        assert!(job.status_history.is_empty());
        assert_eq!(job.task_result(), serde_json::Value::Null);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let backoff = Backoff {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(5000));
        assert_eq!(backoff.delay_for_attempt(80), Duration::from_millis(5000));
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_string(&JobStatus::Retry).unwrap(), r#""RETRY""#);
        assert_eq!(JobStatus::Started.to_string(), "STARTED");
        assert!(JobStatus::Failure.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn failure_is_reported_as_kind_and_message() {
        let mut job = generate_job();
        job.status = JobStatus::Failure;
        job.error = Some(TaskFailure::from(&TaskError::UnsupportedFormat("vrm".into())));
        let info = TaskInfo::from_job(&job);
        assert_eq!(info.task_result["error"], "UNSUPPORTED_FORMAT");
        assert_eq!(info.task_result["message"], "unsupported format: vrm");
    }

    #[test]
    fn render_kind_round_trips_through_json() {
        let kind = JobKind::Render {
            format: Format::Gif,
            metadata: Metadata {
                id: 4,
                ..Default::default()
            },
            params: RenderParams::default(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "render");
        assert_eq!(json["format"], "gif");
        let back: JobKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
        assert_eq!(back.task_name(), "render_gif");
    }
}
