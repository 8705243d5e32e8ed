//! HTTP routes
//!
//! - `GET /` and `POST /` run the pipeline and return the run summary with
//!   200 (success), 207 (partial failure) or 500 (failure)
//! - `GET /health` liveness check
//! - `GET /archives/:domain` most recent raw archive keys for a domain

use crate::config::CorsConfig;
use crate::error::AppError;
use crate::ingest::Pipeline;
use crate::middleware;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;

const DEFAULT_ARCHIVE_LIMIT: usize = 20;
const MAX_ARCHIVE_LIMIT: usize = 1_000;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

/// Create the application router with all routes and middleware
pub fn create_router(state: AppState, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/", get(trigger_run).post(trigger_run))
        .route("/health", get(health_check))
        .route("/archives/:domain", get(list_archives))
        .with_state(state)
        // Apply layers from innermost to outermost
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(cors))
}

/// Run the pipeline once over every configured domain
async fn trigger_run(State(state): State<AppState>) -> Response {
    match state.pipeline.run().await {
        Ok(summary) => {
            let status = StatusCode::from_u16(summary.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(summary)).into_response()
        },
        Err(e) => {
            tracing::error!(kind = %e.kind(), "Run aborted before processing: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "overall_status": "failure",
                    "message": e.to_string(),
                    "details": {}
                })),
            )
                .into_response()
        },
    }
}

/// Health check handler
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

#[derive(Debug, Deserialize)]
struct ArchiveQuery {
    limit: Option<usize>,
}

async fn list_archives(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, AppError> {
    if !state.pipeline.domains().iter().any(|d| d.id == domain) {
        return Err(AppError::NotFound(format!("unknown domain '{}'", domain)));
    }
    let archiver = state
        .pipeline
        .archiver()
        .ok_or_else(|| AppError::NotFound("raw archiving is disabled".to_string()))?;

    let limit = query.limit.unwrap_or(DEFAULT_ARCHIVE_LIMIT);
    if limit == 0 || limit > MAX_ARCHIVE_LIMIT {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_ARCHIVE_LIMIT
        )));
    }

    let keys = archiver.list(&domain, limit).await?;
    Ok((StatusCode::OK, Json(json!({ "domain": domain, "archives": keys }))).into_response())
}
