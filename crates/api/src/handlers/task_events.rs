use axum::{extract::State, http::StatusCode, Json};
use engine::TaskEventReport;
use tracing::debug;

use crate::{error::ApiError, AppState};

/// Worker callback: a task attempt changed status.
pub async fn report(
    State(state): State<AppState>,
    Json(report): Json<TaskEventReport>,
) -> Result<StatusCode, ApiError> {
    debug!(
        workflow_instance_id = report.workflow_instance_id,
        task_instance_id = report.task_instance_id,
        status = %report.status,
        "task event received"
    );
    state.coordinator.report_task_event(report)?;
    Ok(StatusCode::ACCEPTED)
}
