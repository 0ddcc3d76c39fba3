//! Inbound HTTP: build submission, log streaming, log ingest, and result
//! callbacks.
//!
//! Log streaming is chunked JSON-lines; each frame is one [`LogEntry`]. The
//! stream terminates with a trailer echoing the build verdict once the
//! state's log channel closes.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use kiln_state::{LogEntry, LogLevel, Registry};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, error};

use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
    /// Bucket the client CLI uploads contexts into, from `S3_BUCKET`.
    pub context_bucket: String,
    /// Shared opaque token; `None` leaves the API open.
    pub auth_token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/build", post(submit_build))
        .route("/build/{id}/logs", get(stream_logs))
        .route("/build/{id}/logs/ingest", post(ingest_logs))
        .route("/build/{id}/result", post(post_result))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

struct ApiError {
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

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(json!({ "error": self.message }))).into_response()
    }
}

async fn require_token(
    State(app): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &app.auth_token else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        next.run(request).await
    } else {
        ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SubmitParams {
    context_key: String,
    service_name: Option<String>,
}

/// `POST /build` - body is the manifest; returns the build id immediately.
/// Everything after validation flows through the log stream.
async fn submit_build(
    State(app): State<AppState>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (build_id, _) = app
        .orchestrator
        .start_build(
            &body,
            &app.context_bucket,
            &params.context_key,
            params.service_name.as_deref(),
        )
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    Ok(axum::Json(json!({
        "buildID": build_id,
        "status": "started",
    })))
}

/// `GET /build/{id}/logs` - stream entries until the build finishes, then
/// emit the verdict trailer and drop the state from the registry.
async fn stream_logs(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let state = app
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown build {id}")))?;
    let receiver = state
        .take_log_receiver()
        .ok_or_else(|| ApiError::new(StatusCode::CONFLICT, "log stream already claimed"))?;

    let registry = app.registry.clone();
    let trailer = futures::stream::once(async move {
        let (level, verdict) = match state.error() {
            Some(_) => (LogLevel::Error, "BUILD FAILED"),
            None => (LogLevel::Info, "BUILD SUCCEEDED"),
        };
        // The stream has drained; this build is done being observable.
        registry.delete(state.id());
        encode_line(&LogEntry::new(level, verdict))
    });

    let frames = ReceiverStream::new(receiver)
        .map(|entry| encode_line(&entry))
        .chain(trailer)
        .map(Ok::<_, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(frames))
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

#[derive(Debug, Deserialize)]
struct TaskParams {
    task: Option<String>,
}

/// `POST /build/{id}/logs/ingest?task=` - plain-text body, one log line per
/// newline-terminated line.
async fn ingest_logs(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TaskParams>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let task = params
        .task
        .filter(|task| !task.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing task query parameter"))?;
    let state = app
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown build {id}")))?;
    if state.id() != id {
        error!(requested = %id, stored = %state.id(), "ingest routed to mismatched state");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "build state id mismatch",
        ));
    }

    let reader = StreamReader::new(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    );
    let mut lines = reader.lines();
    let mut started = false;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if !started {
                    state.mark_ingest_started(&task);
                    started = true;
                }
                state.append_log(LogLevel::Info, line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(build = %id, task = %task, error = %err, "ingest stream broke");
                return Err(ApiError::bad_request(format!("ingest stream error: {err}")));
            }
        }
    }

    state.mark_ingest_done(&task);
    Ok(StatusCode::OK)
}

/// `POST /build/{id}/result?task=` - worker's final report. The query
/// parameter wins over the body's task id; duplicates are dropped
/// idempotently.
async fn post_result(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TaskParams>,
    axum::Json(payload): axum::Json<kiln_state::TaskResult>,
) -> Result<StatusCode, ApiError> {
    let state = app
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("unknown build {id}")))?;

    let task = params
        .task
        .filter(|task| !task.is_empty())
        .or_else(|| (!payload.task_id.is_empty()).then(|| payload.task_id.clone()))
        .ok_or_else(|| ApiError::bad_request("missing task id"))?;

    state.set_result(
        &task,
        &payload.arch,
        &payload.image_digest,
        payload.success,
        &payload.error,
    );
    Ok(StatusCode::OK)
}

fn encode_line(entry: &LogEntry) -> Bytes {
    let mut line = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    Bytes::from(line)
}
