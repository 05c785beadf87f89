use axum::{
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode},
};
use tracing::{info, warn};

use crate::handlers::auth::require_session;
use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

/// Multipart upload into the uploader's current directory. Each part's
/// filename (or field name) is its destination relative to that directory.
pub async fn upload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<StatusCode> {
    let token = require_session(&state, &headers)?;
    let mut batch = state.hub.begin_upload(&token)?;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "malformed multipart upload");
                batch.discard().await;
                return Err(AppError::bad_request(format!("Malformed upload: {err}")));
            }
        };

        let Some(relative) = field
            .file_name()
            .or_else(|| field.name())
            .map(str::to_string)
        else {
            continue;
        };

        batch.stage_stream(&relative, field).await?;
    }

    let base = batch.base_dir().to_string();
    let placed = state.hub.finish_upload(batch).await;
    info!(dir = %base, files = placed.len(), "upload complete");
    Ok(StatusCode::OK)
}
