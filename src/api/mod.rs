//! HTTP surface: every route only validates, enqueues and reads broker state.
//! Task bodies run on the [`WorkerPool`].

mod handlers;
pub mod wire;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::batch::BatchCoordinator;
use crate::broker::Broker;
use crate::config::ForgeConfig;
use crate::error::{ForgeError, TaskError};
use crate::exporter::{ExporterRegistry, Format};
use crate::hooks::GenerationHooks;
use crate::metadata_store::MetadataStore;
use crate::resolver::TraitSchema;
use crate::results::ResultStore;
use crate::scene::{InMemoryScene, SceneAssetProvider};
use crate::worker::{RunnerEnv, TaskRunner, WorkerPool};
use wire::ErrorBody;

/// Everything a handler needs, built once at startup.
pub struct ServerContext {
    pub config: ForgeConfig,
    pub broker: Broker,
    pub batches: BatchCoordinator,
    pub metadata: Arc<MetadataStore>,
    pub results: ResultStore,
    pub exporters: Arc<ExporterRegistry>,
    pub schema: Arc<TraitSchema>,
}

impl ServerContext {
    pub fn new(
        config: ForgeConfig,
        broker: Broker,
        schema: Arc<TraitSchema>,
        exporters: Arc<ExporterRegistry>,
        results: ResultStore,
    ) -> Self {
        let metadata = Arc::new(MetadataStore::new());
        if metadata.reserve_through(broker.highest_metadata_id()).is_err() {
            tracing::warn!("every metadata id is already in use; generate requests will be rejected");
        }
        Self {
            config,
            batches: BatchCoordinator::new(broker.clone()),
            broker,
            metadata,
            results,
            exporters,
            schema,
        }
    }

    pub fn runner_env(&self, hooks: Arc<dyn GenerationHooks>) -> RunnerEnv {
        RunnerEnv {
            schema: self.schema.clone(),
            exporters: self.exporters.clone(),
            results: self.results.clone(),
            metadata: self.metadata.clone(),
            hooks,
            public_url: self.config.public_url.clone(),
            seed: self.config.seed,
        }
    }

    /// Starts the configured workers, each with a scene from `make_scene`.
    pub fn spawn_workers<F>(&self, hooks: Arc<dyn GenerationHooks>, mut make_scene: F) -> Result<WorkerPool, ForgeError>
    where
        F: FnMut() -> Result<Box<dyn SceneAssetProvider>, ForgeError>,
    {
        let env = self.runner_env(hooks);
        if !self.config.workers.contains_key(self.broker.default_queue()) {
            tracing::warn!(queue = %self.broker.default_queue(), "no workers serve the default queue");
        }
        WorkerPool::spawn(&self.broker, &self.config.workers, || {
            Ok(TaskRunner::new(make_scene()?, env.clone()))
        })
    }
}

/// Error returned by handlers, rendered as `{error, message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "INVALID_BODY",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let status = match &err {
            TaskError::UnsupportedFormat(_) => StatusCode::NOT_FOUND,
            TaskError::SchemaValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TaskError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TaskError::Configuration(_) | TaskError::NoEligibleCandidate { .. } => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            code: err.kind().code(),
            message: err.to_string(),
        }
    }
}

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        match err {
            ForgeError::JobNotFound(_) | ForgeError::BatchNotFound(_) | ForgeError::ArtifactNotFound(_) => {
                Self::not_found(err.to_string())
            }
            ForgeError::Task(task) => task.into(),
            ForgeError::IdsExhausted => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "IDS_EXHAUSTED",
                message: err.to_string(),
            },
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "INTERNAL",
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn router(ctx: Arc<ServerContext>) -> Router {
    let mut router: Router<Arc<ServerContext>> = Router::new()
        .route("/health", get(handlers::health))
        .route("/schema", get(handlers::schema))
        .route("/generate", post(handlers::generate))
        .route("/generate_batch", post(handlers::generate_batch))
        .route("/render_batch", post(handlers::render_batch))
        .route("/task/{task_id}", get(handlers::task_status))
        .route("/batch/{batch_id}", get(handlers::batch_status))
        .route("/batch_metadata/{batch_id}", get(handlers::batch_metadata))
        .route("/rendered/{file_id}", get(handlers::rendered));

    for format in Format::ALL {
        router = router.route(
            &format!("/render_{format}"),
            post(move |State(ctx): State<Arc<ServerContext>>, body: Bytes| {
                handlers::render(ctx, format, body)
            }),
        );
    }
    router.with_state(ctx)
}

/// Builds the server from `config`, starts its workers and serves until
/// ctrl-c.
pub async fn serve(config: ForgeConfig, hooks: Arc<dyn GenerationHooks>) -> anyhow::Result<()> {
    let scene_path: PathBuf = config
        .scene
        .clone()
        .context("no scene configured; set `scene` in traitforge.toml or pass --scene")?;
    let scene = InMemoryScene::load(&scene_path)
        .with_context(|| format!("failed to load scene {}", scene_path.display()))?;
    let schema = Arc::new(TraitSchema::from_scene(&scene));
    let exporters = Arc::new(ExporterRegistry::from_commands(&config.exporters));
    let results = ResultStore::open(&config.results_dir)
        .with_context(|| format!("failed to open results dir {}", config.results_dir.display()))?;
    let broker = Broker::open(config.default_queue.clone(), &config.state_dir)
        .with_context(|| format!("failed to open broker state in {}", config.state_dir.display()))?;
    let ctx = Arc::new(ServerContext::new(config, broker, schema, exporters, results));

    let mut first = Some(scene);
    let pool = ctx.spawn_workers(hooks, || {
        let scene = match first.take() {
            Some(scene) => scene,
            None => InMemoryScene::load(&scene_path)?,
        };
        Ok(Box::new(scene) as Box<dyn SceneAssetProvider>)
    })?;

    let listener = TcpListener::bind(&ctx.config.bind)
        .await
        .with_context(|| format!("failed to bind {}", ctx.config.bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        workers = pool.len(),
        formats = ?ctx.exporters.available(),
        "traitforge listening"
    );

    axum::serve(listener, router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;
    tracing::info!("shutting down workers");
    pool.shutdown().await;
    let broker = ctx.broker.clone();
    tokio::task::spawn_blocking(move || broker.flush())
        .await
        .context("snapshot flush task failed")?
        .context("failed to flush broker snapshot")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
