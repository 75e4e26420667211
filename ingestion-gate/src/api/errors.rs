use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::{ParseError, SourceError, StoreError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable, please retry")]
    Unavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::BatchNotFound(_) | StoreError::RecordNotFound(_) => {
                ApiError::NotFound(error.to_string())
            }
            StoreError::DuplicateBatch(_) | StoreError::InvalidTransition { .. } => {
                ApiError::Conflict(error.to_string())
            }
            StoreError::StorageUnavailable { .. } => ApiError::Unavailable,
            StoreError::Inconsistent(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(error: SourceError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<ParseError> for ApiError {
    fn from(error: ParseError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, status = %status, "request error");
        }

        let body = Json(json!({
            "error": error,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::types::BatchStatus;

    #[test]
    fn test_store_errors_map_to_statuses() {
        let id = Uuid::now_v7();
        let cases = [
            (StoreError::BatchNotFound(id), StatusCode::NOT_FOUND),
            (StoreError::DuplicateBatch(id), StatusCode::CONFLICT),
            (
                StoreError::InvalidTransition {
                    batch_id: id,
                    current: BatchStatus::Failed,
                    requested: BatchStatus::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (
                StoreError::unavailable("INSERT", "pool timed out"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                StoreError::Inconsistent("x".to_owned()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
