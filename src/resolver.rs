//! 根据分类器的输入维度选择分类器的输入

use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use crate::classifier::{Classifier, InputWidth};
use crate::config::ConfDir;
use crate::error::Result;
use crate::fusion::FusedVector;
use crate::utils::write_json;

/// 分类器输入的选择方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputStrategy {
    /// 仅使用深度特征
    Deep,
    /// 使用完整的融合特征
    Fused,
    /// 使用融合特征的前 N 维，只是兼容旧分类器的权宜之计
    Truncated(usize),
    /// 维度对不上，退回深度特征
    FallbackDeep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub label: String,
    pub strategy: InputStrategy,
    pub dim_used: usize,
}

/// 保存到 `results/identity_result.json` 的内容
#[derive(Debug, Serialize)]
struct IdentityResult<'a> {
    image: String,
    #[serde(flatten)]
    resolution: &'a Resolution,
}

/// 根据分类器期望的维度选择输入向量
pub fn select_input(width: InputWidth, deep: &[f32], fused: &FusedVector) -> (InputStrategy, Vec<f32>) {
    let total = fused.len();
    match width {
        InputWidth::Unknown => {
            warn!("分类器没有给出输入维度，使用深度特征");
            (InputStrategy::Deep, deep.to_vec())
        }
        InputWidth::Known(e) if e == deep.len() => (InputStrategy::Deep, deep.to_vec()),
        InputWidth::Known(e) if e == total => (InputStrategy::Fused, fused.as_slice().to_vec()),
        InputWidth::Known(e) if e < total => {
            warn!("分类器期望 {e} 维输入，截取融合特征（{total} 维）的前 {e} 维");
            (InputStrategy::Truncated(e), fused.as_slice()[..e].to_vec())
        }
        InputWidth::Known(e) => {
            warn!(
                "分类器期望 {e} 维输入，与深度特征（{}）和融合特征（{total}）都不匹配，使用深度特征",
                deep.len()
            );
            (InputStrategy::FallbackDeep, deep.to_vec())
        }
    }
}

/// 使用分类器给出单个标签，维度不匹配时降级而不是报错
pub struct IdentityResolver<C> {
    classifier: C,
}

impl<C: Classifier> IdentityResolver<C> {
    pub fn new(classifier: C) -> Self {
        Self { classifier }
    }

    pub fn resolve(&self, deep: &[f32], fused: &FusedVector) -> Result<Resolution> {
        let (strategy, input) = select_input(self.classifier.input_width(), deep, fused);
        let label = self.classifier.predict(&input)?;
        info!("分类结果：{label}（{strategy:?}，{} 维）", input.len());
        Ok(Resolution { label, strategy, dim_used: input.len() })
    }

    /// 分类并保存结果
    pub fn resolve_image(
        &self,
        conf_dir: &ConfDir,
        image: &Path,
        deep: &[f32],
        fused: &FusedVector,
    ) -> Result<Resolution> {
        let resolution = self.resolve(deep, fused)?;
        let result = IdentityResult { image: image.to_string_lossy().into_owned(), resolution: &resolution };
        write_json(conf_dir.identity_result(), &result)?;
        Ok(resolution)
    }
}
