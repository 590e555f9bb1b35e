//! HTTP control surface for the coordinator
//!
//! | route             | method | purpose                             |
//! |-------------------|--------|-------------------------------------|
//! | `/health`         | GET    | liveness, uptime and queue stats    |
//! | `/api/stats`      | GET    | queue and registry statistics       |
//! | `/api/nodes`      | GET    | active nodes, `?role=` filter       |
//! | `/api/urls`       | POST   | submit URLs at a priority           |
//! | `/metrics`        | GET    | Prometheus text format              |

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::Coordinator;
use crate::config::ApiConfig;
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::metrics;
use crate::models::{NodeRole, NodeSummary};
use crate::queue::QueueStats;
use crate::registry::RegistryStats;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
}

/// Cluster statistics
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub registry: RegistryStats,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Deserialize)]
pub struct NodesQuery {
    pub role: Option<String>,
}

/// URL submission
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub submitted: usize,
    pub task_ids: Vec<String>,
}

// ============================================================================
// Server
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Build the router with the configured layers
pub fn build_router(coordinator: Arc<Coordinator>, config: &ApiConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/api/nodes", get(list_nodes))
        .route("/api/urls", post(submit_urls))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { coordinator });

    if config.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    if config.enable_request_logging {
        router = router.layer(TraceLayer::new_for_http());
    }

    router
}

/// Serve the control API until `shutdown` resolves
pub async fn serve<F>(
    coordinator: Arc<Coordinator>,
    config: &ApiConfig,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(coordinator, config);
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|source| ServerError::Bind {
            address: config.bind_address.clone(),
            source,
        })?;

    tracing::info!(address = %config.bind_address, "Control API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let (status_code, status, queue) = match coordinator.queue_stats().await {
        Ok(stats) => (StatusCode::OK, "healthy", Some(stats)),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read queue stats");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", None)
        }
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: coordinator.node_id().to_string(),
        uptime_secs: coordinator.uptime_secs(),
        queue,
    };
    (status_code, Json(response))
}

async fn get_stats(State(state): State<AppState>) -> Response {
    let coordinator = &state.coordinator;
    let queue = match coordinator.queue_stats().await {
        Ok(stats) => stats,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let registry = match coordinator.registry_stats().await {
        Ok(stats) => stats,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let response = StatsResponse {
        queue,
        registry,
        uptime_secs: coordinator.uptime_secs(),
    };
    (StatusCode::OK, Json(ApiResponse::success(response))).into_response()
}

async fn list_nodes(State(state): State<AppState>, Query(query): Query<NodesQuery>) -> Response {
    let role = match query.role.as_deref().map(str::parse::<NodeRole>) {
        None => None,
        Some(Ok(role)) => Some(role),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.coordinator.active_nodes(role).await {
        Ok(nodes) => (
            StatusCode::OK,
            Json(ApiResponse::success(NodesResponse { nodes })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn submit_urls(State(state): State<AppState>, Json(request): Json<SubmitRequest>) -> Response {
    match state
        .coordinator
        .submit_urls(&request.urls, request.priority)
        .await
    {
        Ok(task_ids) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(SubmitResponse {
                submitted: task_ids.len(),
                task_ids,
            })),
        )
            .into_response(),
        Err(e) if e.category() == ErrorCategory::Input => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "URL submission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn metrics_handler() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
