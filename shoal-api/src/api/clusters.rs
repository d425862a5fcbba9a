use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use shoal_common::{Cluster, ClusterStatusInfo, Node};
use std::sync::Arc;

use crate::error::{ApiError, ApiResponse};
use crate::registry::{ClusterFilter, CreateClusterRequest, Page, UpdateClusterRequest};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteClusterResponse {
    pub cluster_id: i64,
    pub nodes_removed: u64,
}

pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateClusterRequest>,
) -> Result<(StatusCode, ApiResponse<Cluster>), ApiError> {
    let cluster = state.registry.create_cluster(request).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(cluster)))
}

pub async fn list_clusters(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ClusterFilter>,
) -> Result<ApiResponse<Page<Cluster>>, ApiError> {
    Ok(ApiResponse::ok(state.registry.list_clusters(&filter).await?))
}

pub async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<ClusterDetail>, ApiError> {
    let (cluster, nodes) = state.registry.get_cluster_with_nodes(id).await?;
    Ok(ApiResponse::ok(ClusterDetail { cluster, nodes }))
}

pub async fn update_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateClusterRequest>,
) -> Result<ApiResponse<Cluster>, ApiError> {
    Ok(ApiResponse::ok(state.registry.update_cluster(id, request).await?))
}

pub async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<DeleteClusterResponse>, ApiError> {
    let nodes_removed = state.clusters.delete_cluster(id).await?;
    Ok(ApiResponse::ok(DeleteClusterResponse {
        cluster_id: id,
        nodes_removed,
    }))
}

pub async fn cluster_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<ClusterStatusInfo>, ApiError> {
    let info = state
        .health
        .cluster_status(&state.registry, state.directory.as_ref(), id)
        .await?;
    Ok(ApiResponse::ok(info))
}
