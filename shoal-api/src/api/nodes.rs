use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use shoal_common::{Node, PrecheckResult};
use std::sync::Arc;

use crate::error::{ApiError, ApiResponse};
use crate::logs::{LogQuery, NodeLogs};
use crate::precheck::PrecheckRequest;
use crate::registry::{NewNode, UpdateNodeRequest};
use crate::state::AppState;

pub async fn add_node(
    State(state): State<Arc<AppState>>,
    Path(cluster_id): Path<i64>,
    Json(request): Json<NewNode>,
) -> Result<(StatusCode, ApiResponse<Node>), ApiError> {
    let node = state.clusters.add_node(cluster_id, request).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(node)))
}

pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Path(cluster_id): Path<i64>,
) -> Result<ApiResponse<Vec<Node>>, ApiError> {
    Ok(ApiResponse::ok(state.registry.list_nodes(cluster_id).await?))
}

pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path((cluster_id, node_id)): Path<(i64, i64)>,
) -> Result<ApiResponse<Node>, ApiError> {
    Ok(ApiResponse::ok(state.registry.get_node(cluster_id, node_id).await?))
}

pub async fn update_node(
    State(state): State<Arc<AppState>>,
    Path((cluster_id, node_id)): Path<(i64, i64)>,
    Json(request): Json<UpdateNodeRequest>,
) -> Result<ApiResponse<Node>, ApiError> {
    let node = state.clusters.update_node(cluster_id, node_id, request).await?;
    Ok(ApiResponse::ok(node))
}

pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    Path((cluster_id, node_id)): Path<(i64, i64)>,
) -> Result<ApiResponse<i64>, ApiError> {
    state.clusters.delete_node(cluster_id, node_id).await?;
    Ok(ApiResponse::ok(node_id))
}

pub async fn precheck_node(
    State(state): State<Arc<AppState>>,
    Path(cluster_id): Path<i64>,
    Json(request): Json<PrecheckRequest>,
) -> Result<ApiResponse<PrecheckResult>, ApiError> {
    Ok(ApiResponse::ok(state.precheck.run(cluster_id, &request).await?))
}

/// Delegates to the configured log collector
pub async fn node_logs(
    State(state): State<Arc<AppState>>,
    Path((cluster_id, node_id)): Path<(i64, i64)>,
    Query(query): Query<LogQuery>,
) -> Result<ApiResponse<NodeLogs>, ApiError> {
    let collector = state
        .log_collector
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("No log collector configured".to_string()))?;

    query.validate()?;
    let node = state.registry.get_node(cluster_id, node_id).await?;
    let host = state.directory.get_host(node.host_id).await?;

    let logs = collector.collect(&node, host.as_ref(), &query).await?;
    Ok(ApiResponse::ok(logs))
}
