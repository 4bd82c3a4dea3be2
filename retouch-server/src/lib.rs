pub mod error;
pub mod handlers;
pub mod settings;
pub mod types;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use retouch_core::ModelResource;
use tower_http::trace::TraceLayer;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// State shared by all handlers.
pub struct AppState {
    pub resource: Arc<ModelResource>,
    /// Unix timestamp of server start, reported by `/v1/models`.
    pub started_at: i64,
}

impl AppState {
    pub fn new(resource: Arc<ModelResource>) -> Self {
        Self {
            resource,
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route(handlers::EDITS_PATH, post(handlers::edit_image))
        .route(handlers::MODELS_PATH, get(handlers::list_models))
        .route(handlers::HEALTH_PATH, get(handlers::health))
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
