use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use db::models::{Command, TaskInstance, WorkflowInstance};
use engine::OperationKind;
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedDto {
    pub workflow_instance_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct OperationDto {
    pub operation: OperationKind,
}

#[derive(Debug, Serialize)]
pub struct InstanceDto {
    pub instance: WorkflowInstance,
    pub tasks: Vec<TaskInstance>,
}

/// Admit a workflow instance (start, resume or recover).
pub async fn submit(
    State(state): State<AppState>,
    Json(command): Json<Command>,
) -> Result<(StatusCode, Json<SubmittedDto>), ApiError> {
    let workflow_instance_id = state.coordinator.submit(command).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmittedDto { workflow_instance_id })))
}

pub async fn operate(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<OperationDto>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.operate(id, payload.operation)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn get(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<InstanceDto>, ApiError> {
    let instance = state.coordinator.workflow_instance(id).await?;
    let tasks = state.coordinator.task_instances(id).await?;
    Ok(Json(InstanceDto { instance, tasks }))
}
