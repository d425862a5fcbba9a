use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::deployment::{
    BasicInfo, CancelOutcome, ConfigInfo, DeploymentSession, HostSelection,
};
use crate::error::{ApiError, ApiResponse};
use crate::state::AppState;

type SessionResponse = Result<ApiResponse<DeploymentSession>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize)]
pub struct PluginSelection {
    pub plugins: Vec<String>,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, ApiResponse<DeploymentSession>) {
    let session = state.deployments.create_session().await;
    (StatusCode::CREATED, ApiResponse::ok(session))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> ApiResponse<Vec<DeploymentSession>> {
    ApiResponse::ok(state.deployments.list_sessions().await)
}

pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.get_session(id).await?))
}

pub async fn update_basic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(basic): Json<BasicInfo>,
) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.update_basic(id, basic).await?))
}

pub async fn update_hosts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(hosts): Json<Vec<HostSelection>>,
) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.update_hosts(id, hosts).await?))
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(config): Json<ConfigInfo>,
) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.update_config(id, config).await?))
}

pub async fn update_plugins(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(selection): Json<PluginSelection>,
) -> SessionResponse {
    Ok(ApiResponse::ok(
        state.deployments.update_plugins(id, selection.plugins).await?,
    ))
}

pub async fn run_precheck(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.run_precheck(id).await?))
}

pub async fn advance(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.advance(id).await?))
}

pub async fn back(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.back(id).await?))
}

pub async fn deploy(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.deploy(id).await?))
}

pub async fn retry(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResponse {
    Ok(ApiResponse::ok(state.deployments.retry(id).await?))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<CancelParams>,
) -> Result<ApiResponse<CancelOutcome>, ApiError> {
    Ok(ApiResponse::ok(state.deployments.cancel(id, params.confirm).await?))
}
