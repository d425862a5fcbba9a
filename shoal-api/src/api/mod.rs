//! HTTP surface
//!
//! Route builders per resource, merged into one router that carries the
//! shared state and the tracing/CORS layers.

mod clusters;
mod deployments;
mod nodes;
mod operations;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::health::{HealthResponse, LivenessResponse, ReadinessResponse};
use crate::state::AppState;

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(cluster_routes())
        .merge(node_routes())
        .merge(operation_routes())
        .merge(deployment_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/health/live", get(liveness_probe))
        .route("/api/health/ready", get(readiness_probe))
}

/// Build cluster CRUD and status routes
fn cluster_routes() -> Router<Arc<AppState>> {
    use axum::routing::{delete, post, put};

    Router::new()
        .route("/api/clusters", post(clusters::create_cluster))
        .route("/api/clusters", get(clusters::list_clusters))
        .route("/api/clusters/:id", get(clusters::get_cluster))
        .route("/api/clusters/:id", put(clusters::update_cluster))
        .route("/api/clusters/:id", delete(clusters::delete_cluster))
        .route("/api/clusters/:id/status", get(clusters::cluster_status))
}

/// Build node admission, precheck and log routes
fn node_routes() -> Router<Arc<AppState>> {
    use axum::routing::{delete, post, put};

    Router::new()
        .route("/api/clusters/:id/nodes", post(nodes::add_node))
        .route("/api/clusters/:id/nodes", get(nodes::list_nodes))
        .route("/api/clusters/:id/nodes/precheck", post(nodes::precheck_node))
        .route("/api/clusters/:id/nodes/:node_id", get(nodes::get_node))
        .route("/api/clusters/:id/nodes/:node_id", put(nodes::update_node))
        .route("/api/clusters/:id/nodes/:node_id", delete(nodes::delete_node))
        .route("/api/clusters/:id/nodes/:node_id/logs", get(nodes::node_logs))
}

fn operation_routes() -> Router<Arc<AppState>> {
    use axum::routing::post;

    Router::new()
        .route("/api/clusters/:id/start", post(operations::start_cluster))
        .route("/api/clusters/:id/stop", post(operations::stop_cluster))
        .route("/api/clusters/:id/restart", post(operations::restart_cluster))
}

/// Build deployment workflow routes
fn deployment_routes() -> Router<Arc<AppState>> {
    use axum::routing::{post, put};

    Router::new()
        .route("/api/deployments", post(deployments::create_session))
        .route("/api/deployments", get(deployments::list_sessions))
        .route("/api/deployments/:id", get(deployments::get_session))
        .route("/api/deployments/:id/basic", put(deployments::update_basic))
        .route("/api/deployments/:id/hosts", put(deployments::update_hosts))
        .route("/api/deployments/:id/config", put(deployments::update_config))
        .route("/api/deployments/:id/plugins", put(deployments::update_plugins))
        .route("/api/deployments/:id/precheck", post(deployments::run_precheck))
        .route("/api/deployments/:id/next", post(deployments::advance))
        .route("/api/deployments/:id/back", post(deployments::back))
        .route("/api/deployments/:id/deploy", post(deployments::deploy))
        .route("/api/deployments/:id/retry", post(deployments::retry))
        .route("/api/deployments/:id/cancel", post(deployments::cancel))
}

/// Detailed health check with component status
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let checker = &state.checker;
    let components = vec![
        checker.check_database(&state.database).await,
        checker.check_agent_gateway(&state.gateway),
        checker.check_installer(state.installer_configured),
    ];
    Json(checker.build_response(components))
}

async fn liveness_probe(State(state): State<Arc<AppState>>) -> Json<LivenessResponse> {
    Json(state.checker.liveness())
}

async fn readiness_probe(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_health = state.checker.check_database(&state.database).await;
    let response = state.checker.readiness(&[db_health]);

    if response.ready {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
