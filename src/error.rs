use std::path::PathBuf;

use thiserror::Error;

/// 特征库与召回引擎的错误类型
#[derive(Debug, Error)]
pub enum ReidError {
    /// 需要的持久化文件不存在（索引、元数据、特征库、分类器）
    #[error("找不到{what}: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    /// 两个特征库之间没有共同的键
    #[error("深度特征（{deep} 条）与纹理特征（{pattern} 条）之间没有共同的裁剪图")]
    Alignment { deep: usize, pattern: usize },

    /// 目录为空，无法通过最近邻推断类别
    #[error("目录为空，无法为新图片推断类别")]
    EmptyCatalog,

    /// 写入时向量维度不一致
    #[error("向量维度不一致：期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 单张图片特征提取失败
    #[error("特征提取失败 {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    /// 加载时发现索引与元数据数量不一致
    #[error("{what}数量不一致：{left} != {right}")]
    InconsistentCatalog { what: &'static str, left: usize, right: usize },

    /// 追加时向量与元数据数量不一致
    #[error("向量数量 {vectors} 与元数据数量 {records} 不一致")]
    LengthMismatch { vectors: usize, records: usize },

    /// 图片已在目录中
    #[error("图片已在目录中: {0}")]
    AlreadyEnrolled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T, E = ReidError> = std::result::Result<T, E>;

impl ReidError {
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound { what, path: path.into() }
    }

    pub fn extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Extraction { path: path.into(), reason: reason.to_string() }
    }

    /// 稳定的错误类别名，用于结构化的错误响应
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Alignment { .. } => "alignment",
            Self::EmptyCatalog => "empty_catalog",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Extraction { .. } => "extraction_failure",
            Self::InconsistentCatalog { .. } => "inconsistent_catalog",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::AlreadyEnrolled(_) => "already_enrolled",
            Self::Io(_) => "io",
            Self::Json(_) | Self::Bincode(_) => "serialization",
            Self::ReadNpy(_) | Self::WriteNpy(_) | Self::Shape(_) => "array",
        }
    }
}
