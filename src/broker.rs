//! Job bookkeeping, named queues and retry scheduling.
//!
//! The broker is the one place workers and HTTP handlers coordinate through.
//! Status changes are written to a JSON snapshot by a dedicated writer thread
//! so a restarted process picks up where the previous one stopped; jobs that
//! were not finished are queued again, so a body may run more than once.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::ForgeError;
use crate::jobs::{Batch, Job, JobKind, JobOutcome, JobSpec, JobStatus, StateMachine, TaskInfo, Transition};

const SNAPSHOT_FILE: &str = "broker.json";
const SNAPSHOT_VERSION: u32 = 1;

/// A job to be created.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub task: String,
    pub kind: JobKind,
    pub spec: JobSpec,
}

impl JobRequest {
    /// Uses the kind's own task name (`generate`, `render_glb`, ...).
    pub fn new(kind: JobKind, spec: JobSpec) -> Self {
        Self {
            task: kind.task_name(),
            kind,
            spec,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    jobs: Vec<Job>,
    batches: Vec<Batch>,
    #[serde(default)]
    queues: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct BrokerState {
    jobs: HashMap<String, Job>,
    batches: HashMap<String, Batch>,
    queues: HashMap<String, VecDeque<String>>,
}

enum WriterMsg {
    Dirty,
    /// Answered once every change signalled before it is on disk.
    Flush(mpsc::Sender<Result<(), String>>),
}

/// Owns the thread that writes snapshots. Bursts of changes collapse into
/// one write; the file I/O happens outside the state lock.
struct SnapshotWriter {
    tx: Option<mpsc::Sender<WriterMsg>>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    fn spawn(state: Arc<Mutex<BrokerState>>, path: PathBuf) -> Result<Self, ForgeError> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("broker-snapshot".into())
            .spawn(move || write_loop(&state, &path, &rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn send(&self, msg: WriterMsg) -> Result<(), ForgeError> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(msg).ok())
            .ok_or_else(|| ForgeError::Io(std::io::Error::other("snapshot writer stopped")))
    }
}

impl Drop for SnapshotWriter {
    /// Pending changes are written before the last broker handle goes away.
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("broker snapshot writer panicked");
        }
    }
}

fn write_loop(state: &Mutex<BrokerState>, path: &Path, rx: &mpsc::Receiver<WriterMsg>) {
    while let Ok(first) = rx.recv() {
        let mut dirty = false;
        let mut waiters = Vec::new();
        for msg in std::iter::once(first).chain(rx.try_iter()) {
            match msg {
                WriterMsg::Dirty => dirty = true,
                WriterMsg::Flush(reply) => waiters.push(reply),
            }
        }

        let result = if dirty {
            let snapshot = {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                Snapshot::of(&state)
            };
            write_snapshot(&snapshot, path).map_err(|e| e.to_string())
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist broker snapshot");
        }
        for reply in waiters {
            let _ = reply.send(result.clone());
        }
    }
}

fn write_snapshot(snapshot: &Snapshot, path: &Path) -> Result<(), ForgeError> {
    let json = serde_json::to_string(snapshot)?;
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, json)?;
    std::fs::rename(&temp, path)?;
    tracing::debug!(jobs = snapshot.jobs.len(), "broker snapshot written");
    Ok(())
}

impl Snapshot {
    fn of(state: &BrokerState) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            jobs: state.jobs.values().cloned().collect(),
            batches: state.batches.values().cloned().collect(),
            queues: state
                .queues
                .iter()
                .map(|(name, ids)| (name.clone(), ids.iter().cloned().collect()))
                .collect(),
        }
    }
}

struct Inner {
    state: Arc<Mutex<BrokerState>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    default_queue: String,
    writer: Option<SnapshotWriter>,
}

/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// A broker with no persistence.
    pub fn in_memory(default_queue: impl Into<String>) -> Self {
        Self::build(default_queue.into(), Arc::new(Mutex::new(BrokerState::default())), None)
    }

    /// Opens (or creates) the snapshot in `state_dir` and re-queues every
    /// job that had not reached a terminal status.
    pub fn open(default_queue: impl Into<String>, state_dir: &Path) -> Result<Self, ForgeError> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(SNAPSHOT_FILE);

        let mut state = BrokerState::default();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            let unfinished = |id: &String| {
                snapshot
                    .jobs
                    .iter()
                    .any(|j| &j.id == id && !j.status.is_terminal())
            };

            // Jobs already taken by a worker go first, then each queue in its
            // saved order.
            let mut taken: Vec<&Job> = snapshot
                .jobs
                .iter()
                .filter(|j| {
                    !j.status.is_terminal()
                        && !snapshot.queues.get(&j.queue).is_some_and(|q| q.contains(&j.id))
                })
                .collect();
            taken.sort_by_key(|j| j.created_at);
            for job in taken {
                state
                    .queues
                    .entry(job.queue.clone())
                    .or_default()
                    .push_back(job.id.clone());
            }
            for (queue, ids) in &snapshot.queues {
                let entry = state.queues.entry(queue.clone()).or_default();
                entry.extend(ids.iter().filter(|id| unfinished(id)).cloned());
            }
            tracing::info!(
                jobs = snapshot.jobs.len(),
                requeued = state.queues.values().map(VecDeque::len).sum::<usize>(),
                batches = snapshot.batches.len(),
                "loaded broker snapshot"
            );
            state.jobs = snapshot.jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
            state.batches = snapshot.batches.into_iter().map(|b| (b.id.clone(), b)).collect();
        }

        let state = Arc::new(Mutex::new(state));
        let writer = SnapshotWriter::spawn(state.clone(), path)?;
        Ok(Self::build(default_queue.into(), state, Some(writer)))
    }

    fn build(default_queue: String, state: Arc<Mutex<BrokerState>>, writer: Option<SnapshotWriter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                notifiers: Mutex::new(HashMap::new()),
                default_queue,
                writer,
            }),
        }
    }

    /// Blocks until every change made so far is on disk.
    pub fn flush(&self) -> Result<(), ForgeError> {
        let Some(writer) = &self.inner.writer else {
            return Ok(());
        };
        let (reply, done) = mpsc::channel();
        writer.send(WriterMsg::Flush(reply))?;
        done.recv()
            .map_err(|_| ForgeError::Io(std::io::Error::other("snapshot writer stopped")))?
            .map_err(|e| ForgeError::Io(std::io::Error::other(e)))
    }

    pub fn default_queue(&self) -> &str {
        &self.inner.default_queue
    }

    /// `queue:task` routes to `queue`; anything else to the default queue.
    pub fn route(&self, task: &str) -> String {
        match task.split_once(':') {
            Some((queue, _)) if !queue.is_empty() => queue.to_string(),
            _ => self.inner.default_queue.clone(),
        }
    }

    pub fn enqueue(&self, request: JobRequest) -> Result<String, ForgeError> {
        let job = self.make_job(request);
        let id = job.id.clone();
        let queue = job.queue.clone();
        {
            let mut state = self.lock();
            state.queues.entry(queue.clone()).or_default().push_back(id.clone());
            state.jobs.insert(id.clone(), job);
            self.mark_dirty()?;
        }
        tracing::info!(job_id = %id, queue = %queue, "job enqueued");
        self.notifier(&queue).notify_one();
        Ok(id)
    }

    /// Enqueues all requests as one batch. Membership never changes after
    /// this returns.
    pub fn enqueue_batch(&self, requests: Vec<JobRequest>) -> Result<String, ForgeError> {
        let jobs: Vec<Job> = requests.into_iter().map(|r| self.make_job(r)).collect();
        let batch = Batch::new(jobs.iter().map(|j| j.id.clone()).collect());
        let batch_id = batch.id.clone();
        let mut touched: Vec<String> = Vec::new();
        {
            let mut state = self.lock();
            for mut job in jobs {
                job.batch_id = Some(batch_id.clone());
                state
                    .queues
                    .entry(job.queue.clone())
                    .or_default()
                    .push_back(job.id.clone());
                touched.push(job.queue.clone());
                state.jobs.insert(job.id.clone(), job);
            }
            state.batches.insert(batch_id.clone(), batch);
            self.mark_dirty()?;
        }
        tracing::info!(batch_id = %batch_id, jobs = touched.len(), "batch enqueued");
        for queue in touched {
            self.notifier(&queue).notify_one();
        }
        Ok(batch_id)
    }

    /// Waits for the next job on `queue` and marks it started.
    pub async fn dequeue(&self, queue: &str) -> Job {
        let notify = self.notifier(queue);
        loop {
            if let Some(job) = self.try_dequeue(queue) {
                return job;
            }
            notify.notified().await;
        }
    }

    /// Takes the next job on `queue` without waiting.
    pub fn try_dequeue(&self, queue: &str) -> Option<Job> {
        let mut state = self.lock();
        loop {
            let id = state.queues.get_mut(queue)?.pop_front()?;
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if !StateMachine::start(job) {
                continue;
            }
            let job = job.clone();
            if let Err(e) = self.mark_dirty() {
                tracing::warn!(job_id = %job.id, error = %e, "broker change not persisted");
            }
            return Some(job);
        }
    }

    /// Applies a body outcome. Retryable failures are queued again after
    /// their backoff delay.
    pub fn record_outcome(&self, job_id: &str, outcome: JobOutcome) -> Result<Transition, ForgeError> {
        let (transition, queue) = {
            let mut state = self.lock();
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| ForgeError::JobNotFound(job_id.to_string()))?;
            let transition = StateMachine::next(job, outcome);
            let queue = job.queue.clone();
            self.mark_dirty()?;
            (transition, queue)
        };

        match &transition {
            Transition::Succeeded => tracing::info!(job_id, queue = %queue, "job succeeded"),
            Transition::Failed(reason) => {
                tracing::warn!(job_id, queue = %queue, error = %reason, "job failed")
            }
            Transition::Retry { attempt, delay, reason } => {
                tracing::warn!(
                    job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "job will be retried"
                );
                let broker = self.clone();
                let id = job_id.to_string();
                let delay = *delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    broker.requeue(&id);
                });
            }
            Transition::Unchanged => {
                tracing::debug!(job_id, "outcome ignored for terminal job")
            }
        }
        Ok(transition)
    }

    /// Puts a job waiting in RETRY back on its queue.
    pub fn requeue(&self, job_id: &str) {
        let queue = {
            let mut state = self.lock();
            let Some(job) = state.jobs.get(job_id) else {
                return;
            };
            if job.status != JobStatus::Retry {
                return;
            }
            let queue = job.queue.clone();
            state.queues.entry(queue.clone()).or_default().push_back(job_id.to_string());
            if let Err(e) = self.mark_dirty() {
                tracing::warn!(job_id, error = %e, "broker change not persisted");
            }
            queue
        };
        self.notifier(&queue).notify_one();
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.lock().jobs.get(job_id).cloned()
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.lock().jobs.get(job_id).map(|j| j.status)
    }

    pub fn task_info(&self, job_id: &str) -> Option<TaskInfo> {
        self.lock().jobs.get(job_id).map(TaskInfo::from_job)
    }

    pub fn batch(&self, batch_id: &str) -> Option<Batch> {
        self.lock().batches.get(batch_id).cloned()
    }

    /// Members of a batch in submission order.
    pub fn batch_jobs(&self, batch_id: &str) -> Option<Vec<Job>> {
        let state = self.lock();
        let batch = state.batches.get(batch_id)?;
        Some(
            batch
                .job_ids
                .iter()
                .filter_map(|id| state.jobs.get(id).cloned())
                .collect(),
        )
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Highest id any known generate job was given, so a restarted server
    /// keeps allocating above it. Render ids are chosen by clients and do not
    /// count.
    pub fn highest_metadata_id(&self) -> u64 {
        self.lock()
            .jobs
            .values()
            .filter_map(|job| match &job.kind {
                JobKind::Generate { metadata_id } => Some(*metadata_id),
                JobKind::Render { .. } => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn make_job(&self, request: JobRequest) -> Job {
        let queue = request
            .spec
            .queue
            .clone()
            .unwrap_or_else(|| self.route(&request.task));
        Job::new(request.task, queue, request.kind, request.spec)
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        let mut notifiers = self
            .inner
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        notifiers.entry(queue.to_string()).or_default().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signals the writer. Called with the state lock held so signals follow
    /// the order of the changes they describe.
    fn mark_dirty(&self) -> Result<(), ForgeError> {
        match &self.inner.writer {
            Some(writer) => writer.send(WriterMsg::Dirty),
            None => Ok(()),
        }
    }
}
