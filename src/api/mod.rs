//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, request/response models, the
//! streaming relay, the upstream client, and the admin API.

pub mod admin;
pub mod handlers;
pub mod models;
pub mod proxy;
pub mod streaming;
pub mod upstream;

// Re-export commonly used types
pub use admin::{admin_router, ApiDoc};
pub use handlers::{api_usage, chat_completions, list_models, AppState};
pub use models::{ChatCompletionRequest, Message, ModelList, Usage, UsageReport};
pub use proxy::dispatch_chat;
pub use upstream::UpstreamClient;

use axum::{
    response::Redirect,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeFile, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Location of the static admin page, relative to the working directory.
pub const ADMIN_PAGE_PATH: &str = "static/admin.html";

/// Assemble the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/api_usage", get(api_usage))
        .route("/", get(root_redirect))
        .route_service("/admin", ServeFile::new(ADMIN_PAGE_PATH))
        .merge(admin_router())
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(axum::middleware::from_fn(
            crate::core::middleware::request_id_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// The bare root points at the admin page.
async fn root_redirect() -> Redirect {
    Redirect::to("/admin")
}
