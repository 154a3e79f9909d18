use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use log::info;
use tokio::task::block_in_place;
use utoipa::OpenApi;

use super::ApiDoc;
use super::error::{RequestError, Result};
use super::state::AppState;
use super::types::*;
use crate::metrics;
use crate::recall::RecallSource;

/// 识别一张图片
///
/// 目录中没有的图片会先被收录，再进行检索。
#[utoipa::path(
    post,
    path = "/identify",
    request_body(content = IdentifyForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = IdentifyResponse),
        (status = 404, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
        (status = 422, body = ErrorResponse),
    )
)]
pub async fn identify_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
    data: TypedMultipart<IdentifyRequest>,
) -> Result<Json<IdentifyResponse>> {
    if token != state.token {
        return Err(RequestError::Unauthorized.into());
    }

    let file_name = data
        .file
        .metadata
        .file_name
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .ok_or_else(|| RequestError::BadRequest("文件名不能为空".to_string()))?;

    // 以内容哈希作为前缀，同一张图片重复上传时路径相同
    let contents = &data.file.contents;
    let hash = blake3::hash(contents);
    let path = state
        .uploads
        .join(format!("{}_{}", &hash.to_hex()[..8], file_name.to_string_lossy()));

    let start = Instant::now();
    info!("正在识别上传图片 {}", path.display());

    let mut engine = state.engine.lock().await;
    let result = block_in_place(|| -> crate::error::Result<_> {
        fs::create_dir_all(&state.uploads)?;
        if !path.exists() {
            fs::write(&path, contents)?;
        }
        engine.identify(&path)
    });

    let duration = start.elapsed().as_secs_f32();
    match &result {
        Ok(outcome) if outcome.enrolled.is_some() => metrics::observe_identify("enrolled", duration),
        Ok(_) => metrics::observe_identify("matched", duration),
        Err(_) => metrics::observe_identify("error", duration),
    }

    Ok(Json(IdentifyResponse::from(result?)))
}

/// Prometheus 指标
pub async fn metrics_handler() -> String {
    metrics::gather_text()
}

/// OpenAPI 文档
pub async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
