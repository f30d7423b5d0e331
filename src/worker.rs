//! Task bodies and the pool of workers that run them.
//!
//! Every worker owns its own scene behind a [`TaskRunner`]. Bodies run on the
//! blocking pool; the async side only waits on the broker and records
//! outcomes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::error::{ForgeError, TaskError};
use crate::exporter::{ExportRequest, ExporterRegistry, Format, RenderParams};
use crate::hooks::{GenerationHooks, HookContext};
use crate::jobs::{Job, JobKind, JobOutcome};
use crate::metadata_store::MetadataStore;
use crate::model::Metadata;
use crate::resolver::{TraitGraphWalker, TraitSchema};
use crate::results::ResultStore;
use crate::scene::{SceneAssetProvider, SceneGuard};

/// Collaborators shared by every runner.
#[derive(Clone)]
pub struct RunnerEnv {
    pub schema: Arc<TraitSchema>,
    pub exporters: Arc<ExporterRegistry>,
    pub results: ResultStore,
    pub metadata: Arc<MetadataStore>,
    pub hooks: Arc<dyn GenerationHooks>,
    pub public_url: String,
    /// With a seed, generating the same id always yields the same variant.
    pub seed: Option<u64>,
}

/// Runs Generate and Render bodies against one owned scene.
pub struct TaskRunner {
    scene: Box<dyn SceneAssetProvider>,
    env: RunnerEnv,
    rng: StdRng,
}

impl TaskRunner {
    pub fn new(scene: Box<dyn SceneAssetProvider>, env: RunnerEnv) -> Self {
        Self {
            scene,
            env,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn scene(&self) -> &dyn SceneAssetProvider {
        self.scene.as_ref()
    }

    /// Runs `job` and returns the metadata it produced as JSON.
    pub fn run(&mut self, job: &Job) -> Result<serde_json::Value, TaskError> {
        let metadata = match &job.kind {
            JobKind::Generate { metadata_id } => self.generate(&job.id, *metadata_id)?,
            JobKind::Render {
                format,
                metadata,
                params,
            } => self.render(*format, metadata, params)?,
        };
        serde_json::to_value(&metadata).map_err(|e| TaskError::Transient(e.to_string()))
    }

    /// Resolves a fresh variant for `metadata_id` and stores its metadata.
    pub fn generate(&mut self, job_id: &str, metadata_id: u64) -> Result<Metadata, TaskError> {
        let mut seeded;
        let rng = match self.env.seed {
            Some(seed) => {
                seeded = StdRng::seed_from_u64(seed.wrapping_add(metadata_id));
                &mut seeded
            }
            None => &mut self.rng,
        };

        let mut scene = SceneGuard::new(self.scene.as_mut());
        self.env.hooks.pre_generation(&mut HookContext {
            metadata_id,
            job_id,
            scene: &mut *scene,
        })?;

        let root = scene.root_traits().to_vec();
        let resolved = TraitGraphWalker::new(&*scene).walk(&root, rng)?;
        for attribute in &resolved {
            scene.apply_attribute(&attribute.trait_name, &attribute.value)?;
        }
        let mut metadata = Metadata::from_resolved(metadata_id, scene.filename(), &resolved);
        self.env.metadata.put(metadata.clone());

        // Stored again below with any hook edits.
        self.env.hooks.post_generation(
            &mut HookContext {
                metadata_id,
                job_id,
                scene: &mut *scene,
            },
            &mut metadata,
        )?;
        self.env.metadata.put(metadata.clone());
        tracing::debug!(job_id, metadata_id, attributes = metadata.attributes.len(), "variant generated");
        Ok(metadata)
    }

    /// Re-applies `metadata` to the scene, exports it and returns it with
    /// the artifact URL filled in.
    pub fn render(
        &mut self,
        format: Format,
        metadata: &Metadata,
        params: &RenderParams,
    ) -> Result<Metadata, TaskError> {
        let exporter = self.env.exporters.get(format)?;
        let parsed = self.env.schema.validate(metadata)?;
        let (artifact_id, dest) = self.env.results.reserve(format.extension());

        let mut scene = SceneGuard::new(self.scene.as_mut());
        for (name, value) in &parsed {
            scene.apply_attribute(name, value)?;
        }

        let mut attributes = Vec::with_capacity(parsed.len());
        for (name, _) in &parsed {
            let applied = scene.attribute(name).ok_or_else(|| {
                TaskError::Transient(format!("scene dropped attribute `{name}` after applying it"))
            })?;
            attributes.push(self.env.schema.to_attribute(name, &applied));
        }
        let filename = if metadata.filename.is_empty() {
            scene.filename().to_string()
        } else {
            metadata.filename.clone()
        };
        let mut rendered = Metadata {
            id: metadata.id,
            filename,
            attributes,
            rendered_file_url: None,
            rendered_glb_url: metadata.rendered_glb_url.clone(),
        };

        let exported = exporter
            .export(&ExportRequest {
                format,
                metadata: &rendered,
                params,
                scene: &*scene,
                dest: &dest,
            })
            .map_err(TaskError::from)
            .and_then(|written| {
                if written != dest {
                    std::fs::copy(&written, &dest)?;
                }
                Ok(())
            });
        if let Err(err) = exported {
            self.env.results.discard(&artifact_id);
            return Err(err);
        }

        let url = ResultStore::url_for(&self.env.public_url, &artifact_id);
        if format == Format::Glb {
            rendered.rendered_glb_url = Some(url.clone());
        }
        rendered.rendered_file_url = Some(url);
        tracing::debug!(metadata_id = rendered.id, %format, artifact = %artifact_id, "variant rendered");
        Ok(rendered)
    }
}

/// Workers per queue, stopped together.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawns `count` workers for each queue, building one runner per worker.
    pub fn spawn<F>(broker: &Broker, queues: &BTreeMap<String, usize>, mut make_runner: F) -> Result<Self, ForgeError>
    where
        F: FnMut() -> Result<TaskRunner, ForgeError>,
    {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();
        for (queue, &count) in queues {
            for index in 0..count {
                let runner = Arc::new(Mutex::new(make_runner()?));
                let name = format!("{queue}-{index}");
                tracing::info!(worker = %name, queue = %queue, "worker started");
                handles.push(tokio::spawn(worker_loop(
                    name,
                    queue.clone(),
                    broker.clone(),
                    runner,
                    rx.clone(),
                )));
            }
        }
        Ok(Self { handles, shutdown })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Lets running bodies finish, then stops every worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    name: String,
    queue: String,
    broker: Broker,
    runner: Arc<Mutex<TaskRunner>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = broker.dequeue(&queue) => job,
            _ = shutdown.changed() => break,
        };
        tracing::info!(worker = %name, job_id = %job.id, task = %job.task, attempt = job.retry_count + 1, "job started");

        let body_runner = runner.clone();
        let body_job = job.clone();
        let outcome = match tokio::task::spawn_blocking(move || {
            let mut runner = body_runner.lock().unwrap_or_else(PoisonError::into_inner);
            runner.run(&body_job)
        })
        .await
        {
            Ok(Ok(value)) => JobOutcome::Success(value),
            Ok(Err(err)) => JobOutcome::Failure(err),
            Err(join) => JobOutcome::Failure(TaskError::Transient(format!("task body panicked: {join}"))),
        };

        if let Err(e) = broker.record_outcome(&job.id, outcome) {
            tracing::error!(worker = %name, job_id = %job.id, error = %e, "failed to record job outcome");
        }
    }
    tracing::info!(worker = %name, "worker stopped");
}
