use super::AppState;
use crate::{
    errors::AppError,
    services::{
        garbage_collection::{BlobStoreVaultGarbageCollectionTask, TaskResult, TaskStatus},
        task::GarbageCollectionTaskDto,
    },
};
use axum::{Json, extract::State, http::StatusCode};

/// `POST /tasks/gc`: run one garbage collection pass and report it.
///
/// An optional task descriptor body is validated against the task type.
/// Responds 200 for completed or cancelled runs and 500 for failed ones;
/// the body carries the partial progress either way.
pub async fn run_garbage_collection(
    State(state): State<AppState>,
    body: Option<Json<serde_json::Value>>,
) -> Result<(StatusCode, Json<TaskResult>), AppError> {
    let dto = match body {
        Some(Json(value)) => GarbageCollectionTaskDto::from_json(&value.to_string())
            .map_err(|e| AppError::bad_request(e.to_string()))?,
        None => GarbageCollectionTaskDto::default(),
    };

    let task = BlobStoreVaultGarbageCollectionTask::from_dto(&dto, &state.vault);
    let result = task.run(&state.shutdown.child_token()).await;

    let status = match result.status {
        TaskStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        TaskStatus::Completed | TaskStatus::Cancelled => StatusCode::OK,
    };
    Ok((status, Json(result)))
}
