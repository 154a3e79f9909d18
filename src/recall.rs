//! 召回引擎：检索相似的裁剪图，并自动收录目录中没有的图片

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{Catalog, CatalogEntry};
use crate::config::Settings;
use crate::error::{ReidError, Result};
use crate::extract::Extractors;
use crate::fusion::{AlignedRecord, FusedVector, align, fuse};
use crate::metrics;
use crate::store::{FeatureRecord, FeatureStore};
use crate::utils::{cosine_similarity, hash_file, round3, stem_key, write_json};

/// 排名结果中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedMatch {
    /// 从 1 开始的名次
    pub rank: usize,
    /// 余弦相似度
    pub score: f32,
    pub key: String,
    #[serde(rename = "class")]
    pub class_label: String,
    pub image_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecallMetrics {
    /// 排名结果中与第一名同类的比例
    pub precision: f32,
    /// 与第一名同类的全部记录中，出现在排名结果里的比例
    pub recall: f32,
    pub same_class_in_top_k: usize,
    pub same_class_total: usize,
}

/// 一次检索的完整结果，保存到 `results/recall_result.json`
#[derive(Debug, Clone, Serialize)]
pub struct RecallOutcome {
    pub query_image: String,
    /// 本次检索中新收录的记录
    pub enrolled: Option<CatalogEntry>,
    pub best: Option<RankedMatch>,
    pub gallery: Vec<RankedMatch>,
    pub metrics: RecallMetrics,
}

impl RecallOutcome {
    pub fn recall(&self) -> f32 {
        self.metrics.recall
    }
}

/// 召回引擎对外的接口
pub trait RecallSource {
    /// 检索一张图片，必要时先将其收录
    fn identify(&mut self, image: &Path) -> Result<RecallOutcome>;

    /// 重新训练后从磁盘重新加载
    fn reload(&mut self) -> Result<()>;
}

/// 参与排名的检索集合：两个特征库对齐后的记录及其融合向量
struct Gallery {
    records: Vec<AlignedRecord>,
    vectors: Vec<FusedVector>,
    class_counts: HashMap<String, usize>,
}

impl Gallery {
    fn build(deep: &FeatureStore, pattern: &FeatureStore) -> Result<Self> {
        let alignment = align(deep, pattern)?;
        let vectors = alignment.records.par_iter().map(|r| r.fused()).collect();
        let mut class_counts = HashMap::new();
        for r in &alignment.records {
            *class_counts.entry(r.class_label.clone()).or_default() += 1;
        }
        Ok(Self { records: alignment.records, vectors, class_counts })
    }
}

/// 复制到裁剪图目录的结果
enum CropSlot {
    /// 新复制的文件
    Fresh(PathBuf),
    /// 内容相同的文件已经在目录中
    Enrolled(PathBuf),
}

pub struct RecallEngine {
    settings: Settings,
    extractors: Arc<Extractors>,
    catalog: Catalog,
    deep_store: FeatureStore,
    pattern_store: FeatureStore,
    /// 对齐结果的缓存，收录新图片后失效
    gallery: Option<Gallery>,
}

impl RecallEngine {
    /// 从配置目录加载目录与两个特征库
    pub fn open(settings: Settings, extractors: impl Into<Arc<Extractors>>) -> Result<Self> {
        let catalog = Catalog::open(&settings.conf_dir)?;
        let deep_store = FeatureStore::load(settings.conf_dir.deep_store())?;
        let pattern_store = FeatureStore::load(settings.conf_dir.pattern_store())?;
        info!(
            "召回引擎已加载：目录 {} 条，深度特征 {} 条，纹理特征 {} 条",
            catalog.len(),
            deep_store.len(),
            pattern_store.len()
        );
        Ok(Self {
            settings,
            extractors: extractors.into(),
            catalog,
            deep_store,
            pattern_store,
            gallery: None,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn extractors(&self) -> &Extractors {
        &self.extractors
    }

    /// 提取一张图片的深度特征与纹理特征并融合
    pub fn features(&self, image: &Path) -> Result<(Vec<f32>, Vec<f32>, FusedVector)> {
        let deep = self.extractors.deep.extract(image)?;
        let pattern = self.extractors.pattern.extract(image)?;
        let fused = fuse(&deep, &pattern);
        Ok((deep, pattern, fused))
    }

    /// 图片是否已经在目录中
    pub fn check_membership(&self, image: &Path) -> bool {
        self.catalog.contains_path(&image.to_string_lossy())
    }

    /// 将一张新图片收录到目录中，返回新记录与其融合向量
    ///
    /// 类别由目录中的最近邻决定，不会与分类器的结果核对。
    pub fn enroll(&mut self, image: &Path) -> Result<(CatalogEntry, FusedVector)> {
        if self.catalog.is_empty() {
            return Err(ReidError::EmptyCatalog);
        }
        if self.check_membership(image) {
            return Err(ReidError::AlreadyEnrolled(image.to_string_lossy().into_owned()));
        }

        let (_, _, fused) = self.features(image)?;
        let Some(nearest) = self.catalog.nearest(fused.as_slice())? else {
            return Err(ReidError::EmptyCatalog);
        };
        let class_label = self.catalog.entries()[nearest].class_label.clone();
        debug!("最近邻为 {}，类别 {class_label}", self.catalog.entries()[nearest].id);

        let dest = match self.copy_into_crops(image, &class_label)? {
            CropSlot::Fresh(dest) => dest,
            CropSlot::Enrolled(dest) => {
                debug!("{} 与已收录的 {} 内容相同", image.display(), dest.display());
                return Err(ReidError::AlreadyEnrolled(dest.to_string_lossy().into_owned()));
            }
        };
        let (deep, pattern, fused) = self.features(&dest)?;
        for (store, v) in [(&self.deep_store, &deep), (&self.pattern_store, &pattern)] {
            if !store.is_empty() && store.dim() != v.len() {
                return Err(ReidError::DimensionMismatch { expected: store.dim(), actual: v.len() });
            }
        }

        let entry = CatalogEntry::new(
            self.catalog.next_id(&class_label),
            class_label.as_str(),
            dest.to_string_lossy(),
            deep.len(),
            pattern.len(),
        )
        .with_source_path(image.to_string_lossy());
        self.catalog.append(&[fused.as_slice().to_vec()], vec![entry.clone()])?;
        self.deep_store.push(FeatureRecord::new(&dest, class_label.as_str()), &deep)?;
        self.pattern_store.push(FeatureRecord::new(&dest, class_label.as_str()), &pattern)?;

        self.catalog.persist()?;
        self.deep_store.save(self.settings.conf_dir.deep_store())?;
        self.pattern_store.save(self.settings.conf_dir.pattern_store())?;
        self.gallery = None;

        info!("已收录 {} 为 {}，类别 {class_label}", image.display(), entry.id);
        Ok((entry, fused))
    }

    /// 将图片复制到 `crops/<类别>/` 下
    ///
    /// 同名的不同文件会在文件名后加上内容哈希。内容相同的文件若已在目录中则不再收录，
    /// 否则直接复用。
    fn copy_into_crops(&self, image: &Path, class_label: &str) -> Result<CropSlot> {
        let dir = self.settings.conf_dir.crops().join(class_label);
        fs::create_dir_all(&dir)?;
        let Some(file_name) = image.file_name() else {
            return Err(ReidError::extraction(image, "无效的文件名"));
        };

        let dest = dir.join(file_name);
        if !dest.exists() {
            fs::copy(image, &dest)?;
            return Ok(CropSlot::Fresh(dest));
        }

        let hash = hash_file(image)?;
        let short = &hash.to_hex()[..8];
        let name = match image.extension() {
            Some(ext) => format!("{}_{short}.{}", stem_key(image), ext.to_string_lossy()),
            None => format!("{}_{short}", stem_key(image)),
        };
        for candidate in [dest, dir.join(name)] {
            if !candidate.exists() {
                fs::copy(image, &candidate)?;
                return Ok(CropSlot::Fresh(candidate));
            }
            if hash_file(&candidate)? != hash {
                continue;
            }
            if self.check_membership(&candidate) {
                return Ok(CropSlot::Enrolled(candidate));
            }
            debug!("{} 已存在且内容相同，直接复用", candidate.display());
            return Ok(CropSlot::Fresh(candidate));
        }
        Err(ReidError::extraction(image, "裁剪图目录中已有同名的不同文件"))
    }

    fn gallery(&mut self) -> Result<&Gallery> {
        let gallery = match self.gallery.take() {
            Some(gallery) => gallery,
            None => Gallery::build(&self.deep_store, &self.pattern_store)?,
        };
        Ok(self.gallery.insert(gallery))
    }

    /// 与全部对齐记录逐一计算余弦相似度，返回相似度最高的 k 个
    ///
    /// 相似度相同时保持对齐记录的顺序。
    pub fn rank(&mut self, query: &FusedVector, k: usize) -> Result<Vec<RankedMatch>> {
        let gallery = self.gallery()?;
        if let Some(v) = gallery.vectors.first() {
            if v.len() != query.len() {
                return Err(ReidError::DimensionMismatch { expected: v.len(), actual: query.len() });
            }
        }

        let scores = gallery
            .vectors
            .par_iter()
            .map(|v| cosine_similarity(query.as_slice(), v.as_slice()))
            .collect::<Vec<_>>();
        let mut order = (0..scores.len()).collect::<Vec<_>>();
        order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

        Ok(order
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, i)| {
                let record = &gallery.records[i];
                RankedMatch {
                    rank: rank + 1,
                    score: scores[i],
                    key: record.key.clone(),
                    class_label: record.class_label.clone(),
                    image_path: record.image_path.clone(),
                }
            })
            .collect())
    }

    fn metrics(&mut self, ranked: &[RankedMatch]) -> Result<RecallMetrics> {
        let Some(best) = ranked.first() else {
            return Ok(RecallMetrics::default());
        };
        let same_class_in_top_k = ranked.iter().filter(|m| m.class_label == best.class_label).count();
        let same_class_total =
            self.gallery()?.class_counts.get(&best.class_label).copied().unwrap_or(0);
        Ok(compute_metrics(same_class_in_top_k, ranked.len(), same_class_total))
    }
}

/// 计算精确率与召回率，保留三位小数
pub fn compute_metrics(same_class_in_top_k: usize, k: usize, same_class_total: usize) -> RecallMetrics {
    let ratio = |a: usize, b: usize| if b == 0 { 0.0 } else { round3(a as f32 / b as f32) };
    RecallMetrics {
        precision: ratio(same_class_in_top_k, k),
        recall: ratio(same_class_in_top_k, same_class_total),
        same_class_in_top_k,
        same_class_total,
    }
}

impl RecallSource for RecallEngine {
    fn identify(&mut self, image: &Path) -> Result<RecallOutcome> {
        let start = Instant::now();
        let query_image = image.to_string_lossy().into_owned();

        let (enrolled, query) = if self.check_membership(image) {
            debug!("{query_image} 已在目录中");
            (None, self.features(image)?.2)
        } else {
            match self.enroll(image) {
                Ok((entry, fused)) => (Some(entry), fused),
                Err(ReidError::AlreadyEnrolled(dest)) => {
                    debug!("{query_image} 已作为 {dest} 收录");
                    (None, self.features(image)?.2)
                }
                Err(e) => return Err(e),
            }
        };

        let gallery = self.rank(&query, self.settings.recall.top_k)?;
        let metrics = self.metrics(&gallery)?;
        metrics::RECALL_SCORE.observe(metrics.recall as f64);

        let outcome = RecallOutcome {
            query_image,
            enrolled,
            best: gallery.first().cloned(),
            gallery,
            metrics,
        };
        write_json(self.settings.conf_dir.recall_result(), &outcome)?;

        match &outcome.best {
            Some(best) => info!(
                "最佳匹配 {}（{}），相似度 {:.4}，精确率 {:.3}，召回率 {:.3}，耗时 {:.2}s",
                best.image_path,
                best.class_label,
                best.score,
                metrics.precision,
                metrics.recall,
                start.elapsed().as_secs_f32()
            ),
            None => warn!("检索集合为空，没有匹配结果"),
        }
        Ok(outcome)
    }

    fn reload(&mut self) -> Result<()> {
        self.catalog = Catalog::open(&self.settings.conf_dir)?;
        self.deep_store = FeatureStore::load(self.settings.conf_dir.deep_store())?;
        self.pattern_store = FeatureStore::load(self.settings.conf_dir.pattern_store())?;
        self.gallery = None;
        info!("召回引擎已重新加载：目录 {} 条", self.catalog.len());
        Ok(())
    }
}

/// 第一次检索时才打开的召回引擎
///
/// 配置目录中还没有目录时检索失败，由重新训练建立目录后再通过 `reload` 打开。
pub struct LazyRecallEngine {
    settings: Settings,
    extractors: Arc<Extractors>,
    engine: Option<RecallEngine>,
}

impl LazyRecallEngine {
    pub fn new(settings: Settings, extractors: Extractors) -> Self {
        Self { settings, extractors: Arc::new(extractors), engine: None }
    }

    /// 已经打开的引擎
    pub fn engine(&self) -> Option<&RecallEngine> {
        self.engine.as_ref()
    }

    fn open(&mut self) -> Result<&mut RecallEngine> {
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => RecallEngine::open(self.settings.clone(), self.extractors.clone())?,
        };
        Ok(self.engine.insert(engine))
    }
}

impl RecallSource for LazyRecallEngine {
    fn identify(&mut self, image: &Path) -> Result<RecallOutcome> {
        self.open()?.identify(image)
    }

    fn reload(&mut self) -> Result<()> {
        match self.engine.as_mut() {
            Some(engine) => engine.reload(),
            None => self.open().map(|_| ()),
        }
    }
}
