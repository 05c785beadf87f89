use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use dropshelf_core::ShareError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::Unauthorized => Self::unauthorized("Unauthorized"),
            ShareError::InvalidPath(path) => Self::bad_request(format!("Invalid path: {path}")),
            ShareError::NotFound(path) => Self::not_found(format!("Not found: {path}")),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal("Internal server error")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::not_found("Not found");
        }
        tracing::error!(error = %err, "filesystem operation failed");
        Self::internal("Filesystem operation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_errors_map_to_statuses() {
        assert_eq!(
            AppError::from(ShareError::Unauthorized).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(ShareError::InvalidPath("/a*b".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(ShareError::NotFound("/gone".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(ShareError::Store("corrupt".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
