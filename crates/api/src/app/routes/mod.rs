use axum::{routing::get, Router};

pub mod events;
pub mod system;
pub mod webhooks;

/// Router for all endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/ready", get(system::ready))
        .route("/stats", get(system::stats))
        .nest("/webhooks", webhooks::router())
        .nest("/events", events::router())
}
