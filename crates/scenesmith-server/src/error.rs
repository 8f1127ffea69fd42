use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Maps a handler failure to an HTTP response. Handlers that can fail for
/// more than one reason return this instead of a bare `StatusCode`, so the
/// body always carries a human-readable `error` string (spec.md §7's
/// "failed sessions expose result.error" philosophy extended to the HTTP
/// surface itself).
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<scenesmith_store::StorageError> for ApiError {
    fn from(err: scenesmith_store::StorageError) -> Self {
        ApiError::internal(err.to_string())
    }
}
