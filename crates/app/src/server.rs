//! HTTP surface for ingestion jobs and answers.

use crate::services::Services;
use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{header, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use supportkb_core::{AnswerRouter, ApprovalItem, JobError, JobStore, UploadedFile};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Headroom on top of the batch limit for multipart framing.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobStore>,
    pub router: Arc<AnswerRouter>,
}

/// JSON error body `{"ok": false, "error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        let status = match &error {
            JobError::AtCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            JobError::NotFound(_) | JobError::ImageNotFound { .. } => StatusCode::NOT_FOUND,
            JobError::NotFinished(_) => StatusCode::CONFLICT,
            _ if error.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"ok": false, "error": self.message})),
        )
            .into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "status": "ok",
        "jobs": state.jobs.len(),
        "active_jobs": state.jobs.active_jobs(),
    }))
}

async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::new(error.status(), error.body_text()))?
    {
        if !matches!(field.name(), Some("files") | Some("file")) {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload-{}", files.len() + 1));
        let mime_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|error| ApiError::new(error.status(), error.body_text()))?;
        files.push(UploadedFile::new(name, mime_type, bytes));
    }

    let job_id = state.jobs.submit(files)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"ok": true, "job_id": job_id})),
    ))
}

async fn job_snapshot(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state.jobs.snapshot(&id)?;
    Ok(Json(json!({"ok": true, "job": snapshot})))
}

async fn job_events(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.jobs.subscribe(&id)?;
    info!(job_id = %id, replay = subscription.backlog.len(), "event subscriber attached");

    let stream = subscription.into_stream().map(|event| {
        let name = event.kind.name();
        let frame = match Event::default().event(name).json_data(&event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, event = name, "dropping unserializable event");
                Event::default().comment("unserializable event")
            }
        };
        Ok::<_, Infallible>(frame)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn job_image(
    State(state): State<AppState>,
    UrlPath((id, key)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let image = state.jobs.image(&id, &key)?;
    Ok((
        [
            (header::CONTENT_TYPE, image.mime_type),
            (header::CACHE_CONTROL, "private, max-age=3600".to_string()),
        ],
        image.bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    items: Vec<ApprovalItem>,
}

async fn approve_job(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = state.jobs.approve(&id, request.items).await?;
    Ok(Json(json!({
        "ok": true,
        "saved": report.saved,
        "failed": report.failed,
    })))
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    question: String,
}

async fn answer(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<Value>, ApiError> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "question must not be empty",
        ));
    }

    let result = state.router.answer(question).await;
    let mut body = serde_json::to_value(&result)
        .map_err(|error| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))?;
    body["ok"] = json!(true);
    Ok(Json(body))
}

/// `static_dir`, when set, is served under `/static` for durable image URLs.
pub fn build_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let upload_limit = state.jobs.limits().max_batch_bytes + MULTIPART_OVERHEAD;

    let mut router = Router::new()
        .route("/health", get(health))
        .route(
            "/api/ingest/jobs",
            post(submit_job).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/ingest/jobs/{id}", get(job_snapshot))
        .route("/api/ingest/jobs/{id}/events", get(job_events))
        .route("/api/ingest/jobs/{id}/images/{key}", get(job_image))
        .route("/api/ingest/jobs/{id}/approve", post(approve_job))
        .route("/api/answer", post(answer));
    if let Some(dir) = static_dir {
        router = router.nest_service("/static", ServeDir::new(dir));
    }

    router
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start(listen: &str, services: Services) -> anyhow::Result<()> {
    let jobs = Arc::new(JobStore::new(
        services.deps,
        services.options,
        services.limits,
    )?);
    let sweeper = jobs.spawn_sweeper();
    let app = build_router(
        AppState {
            jobs,
            router: services.router,
        },
        services.image_dir.as_deref(),
    );

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "supportkb listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
