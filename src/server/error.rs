use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;
use thiserror::Error;

use super::types::ErrorResponse;
use crate::error::ReidError;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// 请求本身有误
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("鉴权失败")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
}

/// API错误类型
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// 错误类别与对应的 HTTP 状态码
    fn classify(&self) -> (StatusCode, &'static str) {
        if let Some(e) = self.0.downcast_ref::<RequestError>() {
            return match e {
                RequestError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
                RequestError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            };
        }
        let Some(e) = self.0.downcast_ref::<ReidError>() else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal");
        };
        let status = match e {
            ReidError::NotFound { .. } => StatusCode::NOT_FOUND,
            ReidError::EmptyCatalog | ReidError::Alignment { .. } => StatusCode::CONFLICT,
            ReidError::DimensionMismatch { .. } | ReidError::Extraction { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.kind())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.classify();
        if status.is_server_error() {
            error!("请求处理失败：{:#}", self.0);
        }
        let body = ErrorResponse { error: kind.to_string(), message: format!("{:#}", self.0) };
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
