mod job;
mod state;

pub use job::{Backoff, Batch, Job, JobKind, JobOutcome, JobSpec, JobStatus, TaskFailure, TaskInfo};
pub use state::{StateMachine, Transition};
