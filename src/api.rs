//! Read-only status API. Admin mutations stay out; this surface exists for
//! dashboards and operator curl.

use crate::storage::Db;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(service_status))
        .route("/api/runs", get(recent_runs))
        .route("/api/schedules", get(schedules))
        .route("/api/watchlist", get(watchlist))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn service_status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.db.get_service_status().await {
        Ok(status) => Json(json!({ "service": status })).into_response(),
        Err(e) => {
            warn!(error = %e, "status query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn recent_runs(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50);
    match state.db.list_recent_runs(limit).await {
        Ok(runs) => Json(json!({ "runs": runs })).into_response(),
        Err(e) => {
            warn!(error = %e, "runs query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn schedules(State(state): State<ApiState>) -> impl IntoResponse {
    match state.db.list_schedules().await {
        Ok(schedules) => Json(json!({ "schedules": schedules })).into_response(),
        Err(e) => {
            warn!(error = %e, "schedules query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn watchlist(State(state): State<ApiState>) -> impl IntoResponse {
    match state.db.list_enabled_stocks().await {
        Ok(stocks) => Json(json!({ "stocks": stocks })).into_response(),
        Err(e) => {
            warn!(error = %e, "watchlist query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
