//! Webhook intake.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use crate::app::{dto::IngestResponse, errors, services::AppServices};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn router() -> Router {
    Router::new().route("/:source", post(receive))
}

/// POST /webhooks/:source
///
/// Accepts any JSON object or array. Replays with the same `Idempotency-Key`
/// return the original event id with status `duplicate`.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let key = match headers.get(IDEMPOTENCY_KEY_HEADER).map(|v| v.to_str()) {
        None => "",
        Some(Ok(key)) => key,
        Some(Err(_)) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Idempotency-Key header must be visible ASCII",
            );
        }
    };

    match services.ingestion.ingest(&source, key, &body).await {
        Ok((event_id, status)) => (
            StatusCode::ACCEPTED,
            Json(IngestResponse { event_id, status }),
        )
            .into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}
