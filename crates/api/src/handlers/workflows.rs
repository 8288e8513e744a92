use axum::{extract::State, http::StatusCode, Json};
use db::models::WorkflowDefinition;

use crate::{error::ApiError, AppState};

/// Validate and store a workflow definition.
pub async fn create(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    state.coordinator.register_definition(&definition).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}
