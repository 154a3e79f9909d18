//! 完整的重建流程：裁剪、提取特征、写入特征库、重建目录、训练分类器

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogEntry};
use crate::classifier::train_classifier;
use crate::config::{ClassifierInput, DetectorKind, PipelineOptions, Settings};
use crate::extract::Extractors;
use crate::fusion::align;
use crate::retrain::Rebuilder;
use crate::store::{FeatureRecord, FeatureStore};
use crate::utils::{hash_file, pb_style, scan_images, suffix_regex};

/// 一次检测得到的裁剪图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// 原始图片
    pub image_path: String,
    pub label: String,
    /// 检测框 `[x1, y1, x2, y2]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
    pub crop_path: String,
}

/// 从原始语料中检测并裁剪出动物，没有检测结果的图片不出现在返回值中
pub trait Detector {
    fn detect_and_crop(&self, corpus_root: &Path) -> Result<Vec<Detection>>;
}

/// 语料已经按 `<类别>/<图片>` 整理好，直接复制到裁剪图目录
pub struct CopyDetector {
    crops: PathBuf,
    re_suf: Regex,
}

impl CopyDetector {
    pub fn new(crops: impl Into<PathBuf>, re_suf: Regex) -> Self {
        Self { crops: crops.into(), re_suf }
    }
}

impl Detector for CopyDetector {
    fn detect_and_crop(&self, corpus_root: &Path) -> Result<Vec<Detection>> {
        let mut detections = vec![];
        for image in scan_images(corpus_root, &self.re_suf) {
            let Some(label) = label_of(&image, corpus_root) else {
                warn!("{} 不在类别目录下，跳过", image.display());
                continue;
            };
            let Some(file_name) = image.file_name() else {
                continue;
            };
            let dest = self.crops.join(&label).join(file_name);
            let identical = dest.exists() && hash_file(&dest)? == hash_file(&image)?;
            if !identical {
                fs::create_dir_all(self.crops.join(&label))?;
                fs::copy(&image, &dest)
                    .with_context(|| format!("无法复制 {} 到 {}", image.display(), dest.display()))?;
            }
            detections.push(Detection {
                image_path: image.to_string_lossy().into_owned(),
                label,
                bbox: None,
                crop_path: dest.to_string_lossy().into_owned(),
            });
        }
        Ok(detections)
    }
}

/// 调用外部检测程序，程序负责写入裁剪图，并在标准输出打印检测结果的 JSON 数组
///
/// 命令中的 `{corpus}` 与 `{crops}` 会被替换为语料目录与裁剪图目录。
pub struct CommandDetector {
    template: String,
    crops: PathBuf,
}

impl CommandDetector {
    pub fn new(template: impl Into<String>, crops: impl Into<PathBuf>) -> Self {
        Self { template: template.into(), crops: crops.into() }
    }
}

impl Detector for CommandDetector {
    fn detect_and_crop(&self, corpus_root: &Path) -> Result<Vec<Detection>> {
        let corpus = corpus_root.to_string_lossy();
        let crops = self.crops.to_string_lossy();
        let mut parts = self
            .template
            .split_whitespace()
            .map(|s| s.replace("{corpus}", &corpus).replace("{crops}", &crops));
        let Some(program) = parts.next() else {
            bail!("检测命令为空");
        };
        fs::create_dir_all(&self.crops)?;

        info!("运行检测程序 {program}");
        let output =
            Command::new(&program).args(parts).output().with_context(|| format!("无法运行 {program}"))?;
        if !output.status.success() {
            bail!(
                "检测程序退出码 {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let detections: Vec<Detection> =
            serde_json::from_slice(&output.stdout).context("无法解析检测程序的输出")?;
        Ok(detections)
    }
}

/// 图片的类别，即其所在目录相对于根目录的第一级目录名
fn label_of(image: &Path, root: &Path) -> Option<String> {
    let relative = image.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?;
    // 直接位于根目录下的图片没有类别
    components.next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

/// 重建结果概况
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    /// 检测得到的裁剪图数量，没有指定语料目录时为 0
    pub detections: usize,
    /// 扫描到的裁剪图数量
    pub scanned: usize,
    pub skipped_deep: usize,
    pub skipped_pattern: usize,
    /// 同时具有两种特征的裁剪图数量
    pub aligned: usize,
    /// 只具有一种特征而被丢弃的数量
    pub dropped: usize,
    pub classes: usize,
    /// 融合向量的维度
    pub dimension: usize,
}

pub struct TrainingPipeline {
    settings: Settings,
    options: PipelineOptions,
    extractors: Extractors,
}

impl TrainingPipeline {
    pub fn new(settings: Settings, options: PipelineOptions, extractors: Extractors) -> Self {
        Self { settings, options, extractors }
    }

    pub fn extractors(&self) -> &Extractors {
        &self.extractors
    }

    fn detector(&self) -> Result<Box<dyn Detector>> {
        let crops = self.settings.conf_dir.crops();
        Ok(match self.options.detector {
            DetectorKind::Copy => {
                Box::new(CopyDetector::new(crops, suffix_regex(&self.options.suffix)))
            }
            DetectorKind::Command => {
                let Some(template) = &self.options.detect_command else {
                    bail!("使用外部检测程序时必须指定 --detect-command");
                };
                Box::new(CommandDetector::new(template, crops))
            }
        })
    }

    /// 并行提取全部裁剪图的两种特征，失败的图片记录日志后跳过
    fn extract_all(
        &self,
        crops: &[(PathBuf, String)],
    ) -> (FeatureStore, FeatureStore, usize, usize) {
        let skipped_deep = AtomicUsize::new(0);
        let skipped_pattern = AtomicUsize::new(0);
        let pb = ProgressBar::new(crops.len() as u64).with_style(pb_style());

        // 并行提取，collect 保持扫描顺序
        let features = crops
            .par_iter()
            .progress_with(pb.clone())
            .map(|(path, _)| {
                let deep = self
                    .extractors
                    .deep
                    .extract(path)
                    .inspect_err(|e| {
                        warn!("{e}");
                        skipped_deep.fetch_add(1, Ordering::Relaxed);
                    })
                    .ok();
                let pattern = self
                    .extractors
                    .pattern
                    .extract(path)
                    .inspect_err(|e| {
                        warn!("{e}");
                        skipped_pattern.fetch_add(1, Ordering::Relaxed);
                    })
                    .ok();
                (deep, pattern)
            })
            .collect::<Vec<_>>();
        pb.finish_with_message("特征提取完成");

        let mut skipped_deep = skipped_deep.into_inner();
        let mut skipped_pattern = skipped_pattern.into_inner();
        let mut deep_store = FeatureStore::new("deep");
        let mut pattern_store = FeatureStore::new("pattern");
        for ((path, label), (deep, pattern)) in crops.iter().zip(features) {
            if let Some(v) = deep {
                if let Err(e) = deep_store.push(FeatureRecord::new(path, label.as_str()), &v) {
                    warn!("{}: {e}", path.display());
                    skipped_deep += 1;
                }
            }
            if let Some(v) = pattern {
                if let Err(e) = pattern_store.push(FeatureRecord::new(path, label.as_str()), &v) {
                    warn!("{}: {e}", path.display());
                    skipped_pattern += 1;
                }
            }
        }
        (deep_store, pattern_store, skipped_deep, skipped_pattern)
    }
}

impl Rebuilder for TrainingPipeline {
    fn rebuild(&mut self) -> Result<BuildReport> {
        let start = Instant::now();
        let conf_dir = self.settings.conf_dir.clone();
        let mut report = BuildReport::default();

        if let Some(corpus) = &self.options.corpus {
            info!("从 {} 裁剪图片", corpus.display());
            report.detections = self.detector()?.detect_and_crop(corpus)?.len();
            info!("检测得到 {} 张裁剪图", report.detections);
        }

        let crops_dir = conf_dir.crops();
        let re_suf = suffix_regex(&self.options.suffix);
        let crops = scan_images(&crops_dir, &re_suf)
            .into_iter()
            .filter_map(|path| label_of(&path, &crops_dir).map(|label| (path, label)))
            .collect::<Vec<_>>();
        if crops.is_empty() {
            bail!("裁剪图目录 {} 中没有图片", crops_dir.display());
        }
        report.scanned = crops.len();
        info!("提取 {} 张裁剪图的特征", crops.len());

        let (deep_store, pattern_store, skipped_deep, skipped_pattern) = self.extract_all(&crops);
        report.skipped_deep = skipped_deep;
        report.skipped_pattern = skipped_pattern;
        if skipped_deep + skipped_pattern > 0 {
            warn!("跳过 {skipped_deep} 张深度特征提取失败的图片，{skipped_pattern} 张纹理特征提取失败的图片");
        }
        deep_store.save(conf_dir.deep_store())?;
        pattern_store.save(conf_dir.pattern_store())?;

        let alignment = align(&deep_store, &pattern_store)?;
        report.aligned = alignment.len();
        report.dropped = alignment.dropped();

        // 编号为类别内的序号
        let mut ordinals: HashMap<&str, usize> = HashMap::new();
        let mut vectors = Vec::with_capacity(alignment.len());
        let mut entries = Vec::with_capacity(alignment.len());
        let mut inputs = Vec::with_capacity(alignment.len());
        let mut labels = Vec::with_capacity(alignment.len());
        for record in &alignment.records {
            let fused = record.fused();
            let ordinal = ordinals.entry(record.class_label.as_str()).or_default();
            *ordinal += 1;
            entries.push(CatalogEntry::new(
                format!("{}_{}", record.class_label, ordinal),
                record.class_label.as_str(),
                record.image_path.as_str(),
                fused.deep_dim(),
                fused.pattern_dim(),
            ));
            inputs.push(match self.options.classifier_input {
                ClassifierInput::Deep => record.deep.clone(),
                ClassifierInput::Fused => fused.as_slice().to_vec(),
            });
            labels.push(record.class_label.clone());
            vectors.push(fused.into_vec());
        }
        report.classes = ordinals.len();
        report.dimension = vectors.first().map(|v| v.len()).unwrap_or(0);

        let mut catalog = Catalog::create(&conf_dir, report.dimension, &self.settings.index)?;
        catalog.append(&vectors, entries)?;
        catalog.persist()?;

        let (classifier, metrics) = train_classifier(&inputs, &labels, self.options.classifier_input)?;
        classifier.save(&conf_dir, &metrics)?;

        info!(
            "重建完成：{} 张裁剪图，{} 个类别，维度 {}，耗时 {:.2}s",
            report.aligned,
            report.classes,
            report.dimension,
            start.elapsed().as_secs_f32()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_of() {
        let root = Path::new("/data/corpus");
        assert_eq!(label_of(Path::new("/data/corpus/tiger/a.jpg"), root), Some("tiger".to_string()));
        assert_eq!(label_of(Path::new("/data/corpus/tiger/x/a.jpg"), root), Some("tiger".to_string()));
        assert_eq!(label_of(Path::new("/data/corpus/a.jpg"), root), None);
        assert_eq!(label_of(Path::new("/other/a.jpg"), root), None);
    }

    #[test]
    fn test_copy_detector() {
        let corpus = tempfile::tempdir().unwrap();
        let crops = tempfile::tempdir().unwrap();
        fs::create_dir_all(corpus.path().join("lion")).unwrap();
        fs::write(corpus.path().join("lion").join("l1.jpg"), b"lion").unwrap();
        fs::write(corpus.path().join("stray.jpg"), b"stray").unwrap();
        fs::write(corpus.path().join("lion").join("notes.txt"), b"text").unwrap();

        let detector = CopyDetector::new(crops.path(), suffix_regex("jpg"));
        let detections = detector.detect_and_crop(corpus.path()).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "lion");
        assert!(crops.path().join("lion").join("l1.jpg").exists());

        // 再次运行时内容相同的文件不会重复复制
        let again = detector.detect_and_crop(corpus.path()).unwrap();
        assert_eq!(again, detections);
    }

    #[test]
    fn test_detection_json() {
        let json = r#"[{"image_path": "a.jpg", "label": "tiger", "bbox": [1, 2, 3, 4], "crop_path": "c.jpg"}]"#;
        let detections: Vec<Detection> = serde_json::from_str(json).unwrap();
        assert_eq!(detections[0].bbox, Some([1.0, 2.0, 3.0, 4.0]));
    }
}
