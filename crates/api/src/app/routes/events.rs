//! Event inspection.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use hookrelay_core::EventId;
use hookrelay_infra::EventStore;

use crate::app::{dto::EventDetail, errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/:id", get(get_event))
}

/// GET /events/:id
///
/// Ids that do not parse are reported as not found.
pub async fn get_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(event_id) = id.parse::<EventId>() else {
        return errors::not_found(format!("event {id} not found"));
    };

    match services.store.find_by_id(event_id).await {
        Ok(Some(event)) => Json(EventDetail::from(event)).into_response(),
        Ok(None) => errors::not_found(format!("event {event_id} not found")),
        Err(e) => errors::store_error_to_response(e, "Failed to load event"),
    }
}
