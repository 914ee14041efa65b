use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use tracing::warn;

use hookrelay_infra::EventStore;

use crate::app::{
    dto::{HealthResponse, ReadyChecks, ReadyResponse, StatsResponse},
    errors,
    services::AppServices,
};

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
    })
}

pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store.ping().await {
        Ok(()) => Json(ReadyResponse {
            status: "ready",
            timestamp: Utc::now(),
            checks: ReadyChecks {
                database: "connected",
            },
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "not_ready", e.to_string())
        }
    }
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store.status_counts().await {
        Ok(events) => Json(StatsResponse {
            total: events.total(),
            events,
            timestamp: Utc::now(),
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e, "Failed to load event counts"),
    }
}
