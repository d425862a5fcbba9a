use axum::extract::{Path, State};
use shoal_common::{Operation, OperationResult};
use std::sync::Arc;

use crate::error::{ApiError, ApiResponse};
use crate::state::AppState;

async fn run(state: &AppState, cluster_id: i64, operation: Operation) -> Result<ApiResponse<OperationResult>, ApiError> {
    let result = state.orchestrator.execute(cluster_id, operation).await?;
    Ok(ApiResponse::ok(result))
}

pub async fn start_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<OperationResult>, ApiError> {
    run(&state, id, Operation::Start).await
}

pub async fn stop_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<OperationResult>, ApiError> {
    run(&state, id, Operation::Stop).await
}

pub async fn restart_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<OperationResult>, ApiError> {
    run(&state, id, Operation::Restart).await
}
