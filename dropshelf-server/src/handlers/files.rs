use std::path::Path;

use axum::{
    Json,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::handlers::auth::require_session;
use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

/// Authenticated download of a file under the files root.
pub async fn download_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    UrlPath(path): UrlPath<String>,
) -> AppResult<Response> {
    require_session(&state, &headers)?;
    let target = state.hub.translator().to_fs(&format!("/{path}"))?;
    stream_file(&target, Disposition::Attachment).await
}

/// Public download through a short link.
pub async fn shortlink_handler(
    State(state): State<AppState>,
    UrlPath(link): UrlPath<String>,
) -> AppResult<Response> {
    let logical = state
        .hub
        .resolve_shortlink(&link)
        .ok_or_else(|| AppError::not_found("Unknown link"))?;
    let target = state.hub.translator().to_fs(&logical)?;
    debug!(%link, path = %logical, "short link resolved");
    stream_file(&target, Disposition::Named).await
}

/// Download of a finished archive from the zip directory.
pub async fn archive_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    UrlPath(path): UrlPath<String>,
) -> AppResult<Response> {
    require_session(&state, &headers)?;
    let target = state.hub.archives().resolve_download(&path)?;
    stream_file(&target, Disposition::Named).await
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.hub.registry().connected_count(),
        "watches": state.hub.watcher().watch_count().await,
    }))
}

#[derive(Debug, Clone, Copy)]
enum Disposition {
    Attachment,
    Named,
}

async fn stream_file(path: &Path, disposition: Disposition) -> AppResult<Response> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(AppError::not_found("Not a file"));
    }
    let file = tokio::fs::File::open(path).await?;

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let disposition = match disposition {
        Disposition::Attachment => HeaderValue::from_static("attachment"),
        Disposition::Named => {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().replace('"', "\\\""))
                .unwrap_or_default();
            HeaderValue::from_bytes(format!("attachment; filename=\"{name}\"").as_bytes())
                .map_err(|err| AppError::internal(format!("invalid file name header: {err}")))?
        }
    };
    let content_type = HeaderValue::from_str(mime.as_ref())
        .map_err(|err| AppError::internal(format!("invalid content type: {err}")))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(meta.len()));
    headers.insert(CONTENT_DISPOSITION, disposition);
    Ok(response)
}
