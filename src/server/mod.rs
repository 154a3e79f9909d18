mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;

pub use self::state::*;
pub use self::types::{ErrorResponse, GalleryItem, IdentifyResponse};

#[derive(OpenApi)]
#[openapi(
    paths(api::identify_handler),
    components(schemas(
        types::IdentifyForm,
        types::IdentifyResponse,
        types::GalleryItem,
        types::ErrorResponse
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/identify", post(api::identify_handler))
        .route("/metrics", get(api::metrics_handler))
        .route("/api-docs/openapi.json", get(api::openapi_handler))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}
