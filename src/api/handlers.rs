use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;

use super::wire::{
    BatchCreated, GenerateBatchQuery, HealthResponse, RenderBatchBody, RenderBatchQuery, RenderWithParams,
    TaskCreated,
};
use super::{ApiError, ServerContext};
use crate::batch::{BatchStatus, generate_requests};
use crate::broker::JobRequest;
use crate::error::TaskError;
use crate::exporter::{Format, RenderParams};
use crate::jobs::{JobKind, TaskInfo};
use crate::model::Metadata;
use crate::resolver::TraitSchema;

type Ctx = State<Arc<ServerContext>>;

pub async fn health(State(ctx): Ctx) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queued: ctx.broker.queue_len(ctx.broker.default_queue()),
        formats: ctx.exporters.available(),
    })
}

pub async fn schema(State(ctx): Ctx) -> Json<TraitSchema> {
    Json(TraitSchema::clone(&ctx.schema))
}

pub async fn generate(State(ctx): Ctx) -> Result<Json<TaskCreated>, ApiError> {
    let metadata_id = ctx.metadata.allocate_id()?;
    let task_id = ctx.broker.enqueue(JobRequest::new(
        JobKind::Generate { metadata_id },
        ctx.config.job_spec(),
    ))?;
    Ok(Json(TaskCreated { task_id }))
}

pub async fn task_status(State(ctx): Ctx, Path(task_id): Path<String>) -> Result<Json<TaskInfo>, ApiError> {
    ctx.broker
        .task_info(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("task {task_id} not found")))
}

/// One handler behind every `/render_<format>` route. Model formats take the
/// metadata as the body; image and video formats wrap it with render params.
pub async fn render(ctx: Arc<ServerContext>, format: Format, body: Bytes) -> Result<Json<TaskCreated>, ApiError> {
    let (metadata, params) = if format.takes_params() {
        let body: RenderWithParams = parse_body(&body)?;
        (body.metadata, body.render_params.unwrap_or_default())
    } else {
        (parse_body::<Metadata>(&body)?, RenderParams::default())
    };
    let request = render_request(&ctx, format, metadata, params)?;
    let task_id = ctx.broker.enqueue(request)?;
    Ok(Json(TaskCreated { task_id }))
}

pub async fn generate_batch(
    State(ctx): Ctx,
    Query(query): Query<GenerateBatchQuery>,
) -> Result<Json<BatchCreated>, ApiError> {
    if query.number_to_generate > 0 {
        let last = query
            .starting_id
            .checked_add(query.number_to_generate - 1)
            .ok_or_else(|| ApiError::unprocessable("starting_id + number_to_generate overflows"))?;
        ctx.metadata.reserve_through(last)?;
    }
    let requests = generate_requests(query.number_to_generate, query.starting_id, &ctx.config.job_spec());
    let batch_id = ctx.batches.submit(requests)?;
    Ok(Json(BatchCreated { batch_id }))
}

pub async fn render_batch(
    State(ctx): Ctx,
    Query(query): Query<RenderBatchQuery>,
    body: Bytes,
) -> Result<Json<BatchCreated>, ApiError> {
    let body: RenderBatchBody = parse_body(&body)?;
    let requests = render_batch_requests(&ctx, &query, body)?;
    let batch_id = ctx.batches.submit(requests)?;
    Ok(Json(BatchCreated { batch_id }))
}

pub async fn batch_status(State(ctx): Ctx, Path(batch_id): Path<String>) -> Result<Json<BatchStatus>, ApiError> {
    Ok(Json(ctx.batches.status(&batch_id)?))
}

pub async fn batch_metadata(
    State(ctx): Ctx,
    Path(batch_id): Path<String>,
) -> Result<Json<Vec<Metadata>>, ApiError> {
    Ok(Json(ctx.batches.metadata(&batch_id)?))
}

pub async fn rendered(State(ctx): Ctx, Path(file_id): Path<String>) -> Result<Response, ApiError> {
    let (bytes, media_type) = ctx.results.get(&file_id)?;
    Ok(([(header::CONTENT_TYPE, media_type)], bytes).into_response())
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::unprocessable(format!("invalid request body: {e}")))
}

/// Checks format support and metadata before anything is queued.
fn render_request(
    ctx: &ServerContext,
    format: Format,
    metadata: Metadata,
    params: RenderParams,
) -> Result<JobRequest, TaskError> {
    if !ctx.exporters.supports(format) {
        return Err(TaskError::UnsupportedFormat(format.to_string()));
    }
    ctx.schema.validate(&metadata)?;
    Ok(JobRequest::new(
        JobKind::Render {
            format,
            metadata,
            params,
        },
        ctx.config.job_spec(),
    ))
}

/// One render job per metadata and selected format, metadata-major. Nothing
/// is queued if any member is invalid.
fn render_batch_requests(
    ctx: &ServerContext,
    query: &RenderBatchQuery,
    body: RenderBatchBody,
) -> Result<Vec<JobRequest>, TaskError> {
    let formats = query.formats();
    let mut requests = Vec::with_capacity(body.metadata_list.len() * formats.len());
    for metadata in &body.metadata_list {
        for &format in &formats {
            requests.push(render_request(ctx, format, metadata.clone(), body.params_for(format))?);
        }
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::ForgeConfig;
    use crate::error::{ErrorKind, ExportError};
    use crate::exporter::{ExportRequest, Exporter, ExporterRegistry};
    use crate::model::Attribute;
    use crate::results::ResultStore;
    use crate::scene::fixtures::character_scene;
    use axum::http::StatusCode;
    use std::path::PathBuf;

    struct Noop(Format);

    impl Exporter for Noop {
        fn format(&self) -> Format {
            self.0
        }

        fn export(&self, request: &ExportRequest<'_>) -> Result<PathBuf, ExportError> {
            Ok(request.dest.to_path_buf())
        }
    }

    fn context(dir: &std::path::Path) -> ServerContext {
        let mut exporters = ExporterRegistry::new();
        exporters.register(Box::new(Noop(Format::Glb)));
        exporters.register(Box::new(Noop(Format::Gif)));
        ServerContext::new(
            ForgeConfig::default(),
            Broker::in_memory("default"),
            Arc::new(TraitSchema::from_scene(&character_scene())),
            Arc::new(exporters),
            ResultStore::open(dir).unwrap(),
        )
    }

    fn metadata(id: u64, legs: &str) -> Metadata {
        let attr = |t: &str, v: &str| Attribute {
            trait_type: t.into(),
            value: v.into(),
        };
        Metadata {
            id,
            filename: "character.json".into(),
            attributes: vec![
                attr("Height", "0.25"),
                attr("Legs", legs),
                attr("Tier", "silver"),
                attr("Hat", "Beanie"),
                attr("Outfit", "Armor"),
                attr("Dents", "1"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn render_request_checks_format_then_schema() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let err = render_request(&ctx, Format::Fbx, metadata(1, "4"), RenderParams::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        assert_eq!(ApiError::from(err).status(), StatusCode::NOT_FOUND);

        let err = render_request(&ctx, Format::Glb, metadata(1, "9"), RenderParams::default()).unwrap_err();
        assert_eq!(ApiError::from(err).status(), StatusCode::UNPROCESSABLE_ENTITY);

        let request = render_request(&ctx, Format::Glb, metadata(1, "4"), RenderParams::default()).unwrap();
        assert_eq!(request.task, "render_glb");
    }

    #[test]
    fn render_batch_expands_metadata_major() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let query = RenderBatchQuery {
            should_render_glb: true,
            should_render_gif: true,
            ..Default::default()
        };
        let body = RenderBatchBody {
            metadata_list: vec![metadata(1, "2"), metadata(2, "3")],
            ..Default::default()
        };
        let requests = render_batch_requests(&ctx, &query, body).unwrap();
        let summary: Vec<(u64, String)> = requests
            .iter()
            .map(|r| match &r.kind {
                JobKind::Render { metadata, .. } => (metadata.id, r.task.clone()),
                JobKind::Generate { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "render_glb".to_string()),
                (1, "render_gif".to_string()),
                (2, "render_glb".to_string()),
                (2, "render_gif".to_string()),
            ]
        );
    }

    #[test]
    fn one_invalid_member_rejects_the_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let query = RenderBatchQuery {
            should_render_glb: true,
            ..Default::default()
        };
        let body = RenderBatchBody {
            metadata_list: vec![metadata(1, "2"), metadata(2, "seven")],
            ..Default::default()
        };
        let err = render_batch_requests(&ctx, &query, body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidation);
        assert_eq!(ctx.broker.queue_len("default"), 0);
    }

    #[test]
    fn unknown_ids_map_to_not_found() {
        let err: ApiError = crate::error::ForgeError::BatchNotFound("b".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err: ApiError = crate::error::ForgeError::ArtifactNotFound("../x".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
