//! 特征提取器：深度特征与纹理特征的来源

mod command;
mod pattern;
mod precomputed;

use std::path::Path;

use anyhow::{Context, Result, bail};
pub use command::CommandExtractor;
pub use pattern::{PATTERN_DIM, PatternExtractor};
pub use precomputed::PrecomputedExtractor;

use crate::config::{ConfDir, DeepSource, ExtractOptions, PatternSource};

/// 将一张图片转换为固定维度的特征向量
///
/// 同一张图片多次提取应得到相同的结果；无法读取的图片返回 [`crate::ReidError::Extraction`]。
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> crate::error::Result<Vec<f32>>;

    /// 输出的特征维度，未知时返回 None
    fn dim(&self) -> Option<usize>;

    /// 用于日志的名称
    fn name(&self) -> &str;
}

/// 一对特征提取器，分别产生深度特征与纹理特征
pub struct Extractors {
    pub deep: Box<dyn FeatureExtractor>,
    pub pattern: Box<dyn FeatureExtractor>,
}

impl Extractors {
    pub fn new(deep: Box<dyn FeatureExtractor>, pattern: Box<dyn FeatureExtractor>) -> Self {
        Self { deep, pattern }
    }

    /// 根据命令行参数构建提取器
    pub fn from_options(opts: &ExtractOptions, conf_dir: &ConfDir) -> Result<Self> {
        let deep: Box<dyn FeatureExtractor> = match opts.deep {
            DeepSource::Command => {
                let Some(template) = &opts.deep_command else {
                    bail!("使用外部程序提取深度特征时必须指定 --deep-command");
                };
                Box::new(CommandExtractor::new("deep", template, opts.deep_dim)?)
            }
            DeepSource::Precomputed => {
                let path = opts.deep_store.clone().unwrap_or_else(|| conf_dir.deep_store());
                let extractor = PrecomputedExtractor::open("deep", &path)
                    .with_context(|| format!("无法加载深度特征库 {}", path.display()))?;
                Box::new(extractor)
            }
        };
        let pattern: Box<dyn FeatureExtractor> = match opts.pattern {
            PatternSource::Native => Box::new(PatternExtractor),
            PatternSource::Precomputed => {
                let path = opts.pattern_store.clone().unwrap_or_else(|| conf_dir.pattern_store());
                let extractor = PrecomputedExtractor::open("pattern", &path)
                    .with_context(|| format!("无法加载纹理特征库 {}", path.display()))?;
                Box::new(extractor)
            }
        };
        Ok(Self { deep, pattern })
    }
}
