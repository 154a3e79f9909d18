//! 个体/物种分类器

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::{ClassifierInput, ConfDir};
use crate::error::{ReidError, Result};
use crate::utils::{cosine_similarity, read_json, round3, write_json};

/// 分类器期望的输入维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputWidth {
    Known(usize),
    /// 分类器无法给出输入维度
    Unknown,
}

pub trait Classifier {
    fn predict(&self, x: &[f32]) -> Result<String>;

    fn input_width(&self) -> InputWidth;
}

/// 最近类中心分类器：每个类别取特征均值，预测时选择余弦相似度最高的类中心
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidClassifier {
    /// 训练时的输入维度，旧版本的模型文件中可能没有
    #[serde(default)]
    input_dim: Option<usize>,
    input: ClassifierInput,
    classes: Vec<String>,
    centroids: Vec<Vec<f32>>,
}

/// 训练结果概况，保存到 `models/classifier_metrics.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierMetrics {
    pub input: ClassifierInput,
    pub input_dim: usize,
    pub samples: usize,
    pub classes: usize,
    pub class_sizes: BTreeMap<String, usize>,
    /// 训练集上的准确率
    pub train_accuracy: f32,
}

impl CentroidClassifier {
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn input(&self) -> ClassifierInput {
        self.input
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReidError::not_found("分类器", path));
        }
        read_json(path)
    }

    /// 保存模型与训练概况
    pub fn save(&self, conf_dir: &ConfDir, metrics: &ClassifierMetrics) -> Result<()> {
        write_json(conf_dir.classifier(), self)?;
        write_json(conf_dir.classifier_metrics(), metrics)?;
        Ok(())
    }
}

impl Classifier for CentroidClassifier {
    fn predict(&self, x: &[f32]) -> Result<String> {
        let mut best: Option<(usize, f32)> = None;
        for (i, centroid) in self.centroids.iter().enumerate() {
            if centroid.len() != x.len() {
                return Err(ReidError::DimensionMismatch { expected: centroid.len(), actual: x.len() });
            }
            let score = cosine_similarity(x, centroid);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        Ok(best.map(|(i, _)| self.classes[i].clone()).unwrap_or_else(|| "unknown".to_string()))
    }

    fn input_width(&self) -> InputWidth {
        match self.input_dim {
            Some(dim) => InputWidth::Known(dim),
            None => InputWidth::Unknown,
        }
    }
}

/// 训练最近类中心分类器
pub fn train_classifier(
    x: &[Vec<f32>],
    y: &[String],
    input: ClassifierInput,
) -> Result<(CentroidClassifier, ClassifierMetrics)> {
    if x.len() != y.len() {
        return Err(ReidError::LengthMismatch { vectors: x.len(), records: y.len() });
    }
    let dim = x.first().map(|v| v.len()).unwrap_or(0);
    if let Some(v) = x.iter().find(|v| v.len() != dim) {
        return Err(ReidError::DimensionMismatch { expected: dim, actual: v.len() });
    }

    // 按类别名排序，保证结果稳定
    let mut sums: BTreeMap<&str, (Vec<f32>, usize)> = BTreeMap::new();
    for (v, label) in x.iter().zip(y) {
        let (sum, count) = sums.entry(label.as_str()).or_insert_with(|| (vec![0.0; dim], 0));
        sum.iter_mut().zip(v).for_each(|(s, x)| *s += x);
        *count += 1;
    }

    let mut classes = vec![];
    let mut centroids = vec![];
    let mut class_sizes = BTreeMap::new();
    for (label, (sum, count)) in sums {
        classes.push(label.to_string());
        centroids.push(sum.iter().map(|s| s / count as f32).collect());
        class_sizes.insert(label.to_string(), count);
    }

    let classifier = CentroidClassifier { input_dim: Some(dim), input, classes, centroids };
    let mut correct = 0;
    for (v, label) in x.iter().zip(y) {
        if classifier.predict(v)? == *label {
            correct += 1;
        }
    }
    let train_accuracy = if x.is_empty() { 0.0 } else { round3(correct as f32 / x.len() as f32) };

    let metrics = ClassifierMetrics {
        input,
        input_dim: dim,
        samples: x.len(),
        classes: class_sizes.len(),
        class_sizes,
        train_accuracy,
    };
    info!(
        "分类器训练完成：{} 个类别，{} 个样本，训练集准确率 {:.3}",
        metrics.classes, metrics.samples, metrics.train_accuracy
    );
    Ok((classifier, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> (Vec<Vec<f32>>, Vec<String>) {
        let x = vec![vec![1.0, 0.1], vec![0.9, 0.0], vec![0.0, 1.0], vec![0.1, 0.8]];
        let y = ["tiger", "tiger", "lion", "lion"].map(String::from).to_vec();
        (x, y)
    }

    #[test]
    fn test_train_and_predict() {
        let (x, y) = dataset();
        let (classifier, metrics) = train_classifier(&x, &y, ClassifierInput::Deep).unwrap();
        assert_eq!(classifier.input_width(), InputWidth::Known(2));
        assert_eq!(classifier.classes(), &["lion".to_string(), "tiger".to_string()]);
        assert_eq!(metrics.train_accuracy, 1.0);
        assert_eq!(metrics.class_sizes["tiger"], 2);
        assert_eq!(classifier.predict(&[2.0, 0.3]).unwrap(), "tiger");
        assert_eq!(classifier.predict(&[0.0, 5.0]).unwrap(), "lion");
    }

    #[test]
    fn test_predict_rejects_width() {
        let (x, y) = dataset();
        let (classifier, _) = train_classifier(&x, &y, ClassifierInput::Deep).unwrap();
        assert!(matches!(classifier.predict(&[1.0]), Err(ReidError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_train_length_mismatch() {
        let (x, _) = dataset();
        let err = train_classifier(&x, &["a".to_string()], ClassifierInput::Fused).unwrap_err();
        assert!(matches!(err, ReidError::LengthMismatch { vectors: 4, records: 1 }));
    }

    #[test]
    fn test_missing_input_dim_is_unknown() {
        let json = r#"{"input": "Deep", "classes": ["a"], "centroids": [[1.0, 0.0]]}"#;
        let classifier: CentroidClassifier = serde_json::from_str(json).unwrap();
        assert_eq!(classifier.input_width(), InputWidth::Unknown);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let conf_dir = ConfDir::new(dir.path());
        let (x, y) = dataset();
        let (classifier, metrics) = train_classifier(&x, &y, ClassifierInput::Fused).unwrap();
        classifier.save(&conf_dir, &metrics).unwrap();

        let loaded = CentroidClassifier::load(conf_dir.classifier()).unwrap();
        assert_eq!(loaded.input(), ClassifierInput::Fused);
        assert_eq!(loaded.predict(&[1.0, 0.0]).unwrap(), "tiger");
        assert!(conf_dir.classifier_metrics().exists());
        assert!(CentroidClassifier::load(dir.path().join("none.json")).is_err());
    }
}
