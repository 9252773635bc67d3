#![forbid(unsafe_code)]

//! HTTP surface: the Telegram webhook, direct job submission, signed file
//! retrieval and a liveness probe.

use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use crate::chat::{ChatApi, InboundMessage, parse_update};
use crate::command::{CommandIntent, Rejection, Resolution, is_decoy, parse_command};
use crate::dispatch::{DispatchError, DownloadJob, JobPayload, JobQueue, JobRecord};
use crate::history::HistoryStore;
use crate::messages;
use crate::storage::{LocalObjectStore, ObjectInfo, ObjectStore, VIDEOS_BUCKET, belongs_to_chat};

pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";
pub const INVALID_FORMAT: &str = "Invalid message format";

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<dyn ChatApi>,
    pub store: Arc<dyn ObjectStore>,
    /// Serves signed retrieval links; usually the same store as `store`.
    pub files: Arc<LocalObjectStore>,
    pub history: Arc<HistoryStore>,
    pub queue: JobQueue,
    pub webhook_secret: Option<Arc<str>>,
    pub history_limit: usize,
}

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

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn unavailable(err: DispatchError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(job_status))
        .route("/files/{bucket}/{*key}", get(download_file))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Rejects the request unless it carries the configured secret token header.
fn require_secret(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = &state.webhook_secret else {
        return Ok(());
    };
    let provided = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided != Some(expected.as_ref()) {
        tracing::warn!("request with a wrong secret token");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid secret token"));
    }
    Ok(())
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    require_secret(&state, &headers)?;

    let Some(message) = parse_update(&body) else {
        tracing::warn!(bytes = body.len(), "webhook body without a text message");
        return Ok((StatusCode::OK, INVALID_FORMAT).into_response());
    };
    tracing::info!(chat_id = message.chat_id, text = %message.text, "message received");

    if let Err(err) = state.history.record(&message, Utc::now()).await {
        tracing::warn!(chat_id = message.chat_id, error = %format!("{err:#}"), "history not recorded");
    }

    let reply = match parse_command(&message.text) {
        CommandIntent::List => list_reply(&state, message.chat_id).await,
        CommandIntent::Delete(name) => delete_reply(&state, message.chat_id, &name).await,
        CommandIntent::Help => messages::HELP.to_string(),
        CommandIntent::History => history_reply(&state, message.chat_id).await,
        CommandIntent::Download { url, resolution } => {
            let job = download_job(&message, url, resolution.as_str());
            state.queue.enqueue(job).map_err(|err| {
                tracing::error!(chat_id = message.chat_id, error = %err, "job not scheduled");
                ApiError::unavailable(err)
            })?;
            messages::QUEUED.to_string()
        }
        CommandIntent::Invalid(Rejection::Decoy) => messages::DECOY_REFUSAL.to_string(),
        CommandIntent::Invalid(Rejection::Usage | Rejection::UnknownResolution) => {
            messages::HELP.to_string()
        }
    };

    if let Err(err) = state.chat.send_message(message.chat_id, &reply).await {
        tracing::error!(chat_id = message.chat_id, error = %format!("{err:#}"), "reply not delivered");
    }
    Ok((StatusCode::OK, "OK").into_response())
}

fn download_job(message: &InboundMessage, url: String, resolution: &str) -> DownloadJob {
    DownloadJob {
        chat_id: message.chat_id,
        first_name: message.first_name.clone(),
        last_name: message.last_name.clone(),
        url,
        resolution: resolution.to_string(),
    }
}

async fn chat_objects(state: &AppState, chat_id: i64) -> Result<Vec<ObjectInfo>, String> {
    let objects = state
        .store
        .list(VIDEOS_BUCKET, &chat_id.to_string())
        .await
        .map_err(|err| err.to_string())?;
    Ok(objects
        .into_iter()
        .filter(|object| belongs_to_chat(&object.key, chat_id))
        .collect())
}

async fn list_reply(state: &AppState, chat_id: i64) -> String {
    match chat_objects(state, chat_id).await {
        Ok(objects) => format_listing(&objects),
        Err(err) => {
            tracing::error!(chat_id, error = %err, "listing failed");
            messages::LIST_FAILED.to_string()
        }
    }
}

fn format_listing(objects: &[ObjectInfo]) -> String {
    if objects.is_empty() {
        return messages::LIST_EMPTY.to_string();
    }
    let lines: Vec<String> = objects
        .iter()
        .enumerate()
        .map(|(index, object)| {
            format!(
                "{} - {} ({:.2} MB)",
                index + 1,
                object.file_name(),
                object.size_mb()
            )
        })
        .collect();
    format!("{}{}", messages::LIST_HEADER, lines.join("\n"))
}

async fn delete_reply(state: &AppState, chat_id: i64, name: &str) -> String {
    if name.is_empty() {
        return messages::DELETE_USAGE.to_string();
    }

    let target = match chat_objects(state, chat_id).await {
        Ok(objects) => objects
            .into_iter()
            .find(|object| object.file_name() == name || object.key == name),
        Err(err) => {
            tracing::error!(chat_id, error = %err, "listing before delete failed");
            None
        }
    };
    let Some(target) = target else {
        return messages::delete_failed(name);
    };

    match state.store.delete(VIDEOS_BUCKET, &target.key).await {
        Ok(true) => {
            tracing::info!(chat_id, key = %target.key, "object deleted");
            messages::deleted(name)
        }
        Ok(false) => messages::delete_failed(name),
        Err(err) => {
            tracing::error!(chat_id, key = %target.key, error = %err, "delete failed");
            messages::delete_failed(name)
        }
    }
}

async fn history_reply(state: &AppState, chat_id: i64) -> String {
    match state.history.recent(chat_id, state.history_limit).await {
        Ok(entries) if entries.is_empty() => messages::HISTORY_EMPTY.to_string(),
        Ok(entries) => entries
            .iter()
            .map(|entry| entry.display_line())
            .collect::<Vec<_>>()
            .join("\n"),
        Err(err) => {
            tracing::error!(chat_id, error = %format!("{err:#}"), "history read failed");
            messages::HISTORY_FAILED.to_string()
        }
    }
}

#[derive(Serialize)]
struct JobAccepted {
    id: String,
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    require_secret(&state, &headers)?;
    let JobPayload::ProcessVideo(job) = serde_json::from_slice(&body)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid job payload: {err}")))?;
    if is_decoy(&job.url) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "url is not accepted"));
    }
    if let Err(err) = job.resolution.parse::<Resolution>() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, err.to_string()));
    }
    let id = state.queue.enqueue(job).map_err(ApiError::unavailable)?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { id })).into_response())
}

async fn job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Json<JobRecord>> {
    require_secret(&state, &headers)?;
    state
        .queue
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job not found"))
}

#[derive(Debug, Deserialize)]
struct LinkQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath((bucket, key)): AxumPath<(String, String)>,
    Query(query): Query<LinkQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return Err(ApiError::forbidden("missing link signature"));
    };
    if !state.files.verify_link(&bucket, &key, expires, &signature) {
        return Err(ApiError::forbidden("invalid or expired link"));
    }
    let path = state
        .files
        .object_path(&bucket, &key)
        .map_err(|_| ApiError::not_found("file not found"))?;
    stream_file(&path, &headers).await
}

/// Streams a file, honouring a single `Range` header.
async fn stream_file(path: &Path, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_header(&mut response, header::CONTENT_RANGE, &format!("bytes */{size}"));
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                &format!("bytes {start}-{end}/{size}"),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(path).first() {
        insert_header(&mut response, header::CONTENT_TYPE, mime.as_ref());
    }
    if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
        insert_header(
            &mut response,
            header::CONTENT_DISPOSITION,
            &format!("attachment; filename=\"{}\"", name.replace('"', "")),
        );
    }
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let (start_str, end_str) = range.trim().split_once('-')?;

    if start_str.is_empty() {
        // "-N" is the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    (end >= start).then_some((start, end))
}
