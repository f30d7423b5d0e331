//! Fan-out of many jobs under one id, and their aggregated progress.

use serde::{Deserialize, Serialize};

use crate::broker::{Broker, JobRequest};
use crate::error::ForgeError;
use crate::jobs::{JobKind, JobSpec, JobStatus, TaskInfo};
use crate::model::Metadata;

/// Overall state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchState {
    /// Every member succeeded.
    Success,
    /// At least one member failed.
    Failure,
    Waiting,
}

/// Poll response for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: BatchState,
    pub completed_count: usize,
    pub total_count: usize,
    pub percent_complete: f64,
    pub batch_result: Vec<TaskInfo>,
}

pub struct BatchCoordinator {
    broker: Broker,
}

impl BatchCoordinator {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    pub fn submit(&self, requests: Vec<JobRequest>) -> Result<String, ForgeError> {
        self.broker.enqueue_batch(requests)
    }

    /// Aggregates member statuses as of now.
    ///
    /// A member counts as completed once it reaches SUCCESS or FAILURE, so
    /// `percent_complete` only ever grows.
    pub fn status(&self, batch_id: &str) -> Result<BatchStatus, ForgeError> {
        let jobs = self
            .broker
            .batch_jobs(batch_id)
            .ok_or_else(|| ForgeError::BatchNotFound(batch_id.to_string()))?;

        let total_count = jobs.len();
        let completed_count = jobs.iter().filter(|j| j.status.is_terminal()).count();
        let status = if jobs.iter().any(|j| j.status == JobStatus::Failure) {
            BatchState::Failure
        } else if jobs.iter().all(|j| j.status == JobStatus::Success) {
            BatchState::Success
        } else {
            BatchState::Waiting
        };
        let percent_complete = if total_count == 0 {
            1.0
        } else {
            completed_count as f64 / total_count as f64
        };

        Ok(BatchStatus {
            batch_id: batch_id.to_string(),
            status,
            completed_count,
            total_count,
            percent_complete,
            batch_result: jobs.iter().map(TaskInfo::from_job).collect(),
        })
    }

    /// Metadata returned by every successful member, in submission order.
    pub fn metadata(&self, batch_id: &str) -> Result<Vec<Metadata>, ForgeError> {
        let jobs = self
            .broker
            .batch_jobs(batch_id)
            .ok_or_else(|| ForgeError::BatchNotFound(batch_id.to_string()))?;
        Ok(jobs
            .iter()
            .filter(|j| j.status == JobStatus::Success)
            .filter_map(|j| j.result.clone())
            .filter_map(|value| serde_json::from_value::<Metadata>(value).ok())
            .collect())
    }
}

/// Generate requests for ids `starting_id .. starting_id + count`.
pub fn generate_requests(count: u64, starting_id: u64, spec: &JobSpec) -> Vec<JobRequest> {
    (starting_id..starting_id.saturating_add(count))
        .map(|metadata_id| JobRequest::new(JobKind::Generate { metadata_id }, spec.clone()))
        .collect()
}
