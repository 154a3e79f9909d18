use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::Serialize;
use utoipa::ToSchema;

use crate::recall::RecallOutcome;

/// 识别请求参数
#[derive(TryFromMultipart)]
pub struct IdentifyRequest {
    pub file: FieldData<Bytes>,
}

/// 识别表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct IdentifyForm {
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
}

/// 排名结果中的一张图片
#[derive(Debug, Serialize, ToSchema)]
pub struct GalleryItem {
    pub image: String,
    /// 余弦相似度
    pub score: f32,
}

/// 识别响应
#[derive(Debug, Serialize, ToSchema)]
pub struct IdentifyResponse {
    /// 最佳匹配的类别
    pub best_match_label: Option<String>,
    /// 最佳匹配的图片路径
    pub best_match_image: Option<String>,
    pub ranked_gallery: Vec<GalleryItem>,
    /// 最佳匹配的余弦相似度
    pub confidence: f32,
    /// 上传的图片是否被收录到目录中
    pub enrolled: bool,
}

impl From<RecallOutcome> for IdentifyResponse {
    fn from(outcome: RecallOutcome) -> Self {
        Self {
            best_match_label: outcome.best.as_ref().map(|b| b.class_label.clone()),
            best_match_image: outcome.best.as_ref().map(|b| b.image_path.clone()),
            confidence: outcome.best.as_ref().map(|b| b.score).unwrap_or(0.0),
            ranked_gallery: outcome
                .gallery
                .into_iter()
                .map(|m| GalleryItem { image: m.image_path, score: m.score })
                .collect(),
            enrolled: outcome.enrolled.is_some(),
        }
    }
}

/// 错误响应
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// 错误类别，如 `not_found`、`empty_catalog`
    pub error: String,
    pub message: String,
}
