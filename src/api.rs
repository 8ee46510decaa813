use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::fs;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    artifact_store::resolve_artifact,
    auth::extract_provider_key,
    media::{read_upload_form, MediaError, MediaLimits, UploadForm},
    models::{TaskAcceptedResponse, TaskKind, TaskStatus},
    worker, AppState,
};

pub fn router(state: AppState) -> Router {
    let body_limit = MediaLimits::from_config(&state.config).body_limit();

    Router::new()
        .route("/health", get(health))
        .route("/generate-html", post(generate_html))
        .route("/task-status/{task_id}", get(task_status))
        .route("/analyze-refine", post(analyze_refine))
        .route("/analyze-and-refine", post(analyze_refine))
        .route("/download/{task_id}/{*file_name}", get(download))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response<Body> {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into()
            }
        })),
    )
        .into_response()
}

fn media_error_response(err: &MediaError) -> Response<Body> {
    let (status, code) = match err {
        MediaError::Missing => (StatusCode::BAD_REQUEST, "MISSING_MEDIA"),
        MediaError::UnsupportedType(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED_MEDIA_TYPE"),
        MediaError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "MEDIA_TOO_LARGE"),
        MediaError::Malformed(_) => (StatusCode::BAD_REQUEST, "INVALID_UPLOAD"),
    };
    error_response(status, code, err.to_string())
}

fn missing_credential() -> Response<Body> {
    error_response(
        StatusCode::BAD_REQUEST,
        "MISSING_API_KEY",
        "Provide a model API key in the x-api-key header.",
    )
}

/// Credential and form shared by both upload endpoints.
async fn accept_upload(
    state: &AppState,
    headers: &HeaderMap,
    multipart: Multipart,
) -> Result<(String, UploadForm), Response<Body>> {
    let api_key = extract_provider_key(headers).ok_or_else(missing_credential)?;
    let limits = MediaLimits::from_config(&state.config);
    let form = read_upload_form(multipart, &limits).await.map_err(|err| {
        warn!("Rejected upload: {err}");
        media_error_response(&err)
    })?;
    if form.media.is_none() {
        return Err(media_error_response(&MediaError::Missing));
    }
    Ok((api_key, form))
}

fn accepted(task_id: String, message: &str) -> Response<Body> {
    let response = TaskAcceptedResponse {
        task_id,
        status: TaskStatus::Processing,
        message: message.to_string(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "ffmpeg": state.ffmpeg
    }))
}

pub async fn generate_html(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> impl IntoResponse {
    let (api_key, form) = match accept_upload(&state, &headers, multipart).await {
        Ok(accepted) => accepted,
        Err(response) => return response,
    };
    let Some(media) = form.media else {
        return media_error_response(&MediaError::Missing);
    };

    let task_id = state.registry.create(media.kind.task_kind()).await;
    let pipeline = state.pipeline_for(&api_key, form.model);
    info!(
        task_id = %task_id,
        kind = media.kind.as_str(),
        model = %pipeline.settings.model,
        "Accepted generation request"
    );

    worker::spawn_generation(pipeline, task_id.clone(), media);
    accepted(task_id, "Generation started")
}

pub async fn analyze_refine(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> impl IntoResponse {
    let (api_key, form) = match accept_upload(&state, &headers, multipart).await {
        Ok(accepted) => accepted,
        Err(response) => return response,
    };
    let Some(html) = form.html else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_HTML",
            "Provide the current markup in the `html` field.",
        );
    };
    let Some(media) = form.media else {
        return media_error_response(&MediaError::Missing);
    };

    let task_id = state.registry.create(TaskKind::Refine).await;
    let pipeline = state.pipeline_for(&api_key, form.model);
    info!(
        task_id = %task_id,
        kind = media.kind.as_str(),
        model = %pipeline.settings.model,
        "Accepted refinement request"
    );

    worker::spawn_refinement(pipeline, task_id.clone(), media, html);
    accepted(task_id, "Refinement started")
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&task_id).await {
        Ok(task) => (StatusCode::OK, Json(task.to_response(Utc::now()))).into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "TASK_NOT_FOUND", "Task not found."),
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "json" => "application/json",
        "zip" => "application/zip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

pub async fn download(
    State(state): State<AppState>,
    Path((task_id, file_name)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(path) = resolve_artifact(&state.config.artifact_root, &task_id, &file_name) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_FILENAME",
            "File name must not contain path separators or `..`.",
        );
    };

    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return error_response(StatusCode::NOT_FOUND, "FILE_NOT_FOUND", "File not found.");
        }
        Err(err) => {
            warn!("Failed to read {}: {err}", path.display());
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "FILE_READ_FAILED",
                format!("Failed to read file: {err}"),
            );
        }
    };

    let base_name = file_name.rsplit('/').next().unwrap_or(&file_name);
    let disposition = if base_name.ends_with(".zip") {
        format!("attachment; filename=\"{base_name}\"")
    } else {
        format!("inline; filename=\"{base_name}\"")
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(base_name))
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "RESPONSE_BUILD_FAILED",
                "Failed to build download response.",
            )
        })
}
