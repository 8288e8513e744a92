//! Maps engine errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use db::DbError;
use engine::EngineError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Engine(err) => match err {
                EngineError::Graph(_) | EngineError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
                EngineError::RunnableNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::AlreadyRunning(_) | EngineError::RepositoryClosed(_) => {
                    StatusCode::CONFLICT
                }
                EngineError::Database(DbError::NotFound { .. }) => StatusCode::NOT_FOUND,
                EngineError::Database(DbError::Conflict(_)) => StatusCode::CONFLICT,
                EngineError::Database(DbError::Unavailable(_)) | EngineError::Registry(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                EngineError::Executor(_) => StatusCode::BAD_GATEWAY,
                EngineError::MissingStateAction(_) | EngineError::DuplicateStateAction(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
