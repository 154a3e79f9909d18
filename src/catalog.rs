//! 目录：融合向量索引与有序元数据的配对

use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use log::{debug, info, warn};
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};

use crate::config::{ConfDir, IndexKind, IndexOptions};
use crate::error::{ReidError, Result};
use crate::index::{AnyIndex, VectorIndex, distance};
use crate::utils::{ensure_parent, normalize_path, read_json, tmp_path, write_json};

/// 元数据记录的版本
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordSchema {
    /// 包含 `deep_dim` 与 `pattern_dim`
    #[default]
    Current,
    /// 早期版本写入的记录，缺少维度信息，不参与维度检查
    Legacy,
}

/// 兼容各个版本的原始记录，所有字段都是可选的
#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    id: Option<String>,
    class: Option<String>,
    label: Option<String>,
    animal: Option<String>,
    image_path: Option<String>,
    crop_path: Option<String>,
    path: Option<String>,
    output_path: Option<String>,
    deep_dim: Option<usize>,
    pattern_dim: Option<usize>,
    source_path: Option<String>,
}

/// 目录中的一张裁剪图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawRecord")]
pub struct CatalogEntry {
    pub id: String,
    #[serde(rename = "class")]
    pub class_label: String,
    pub image_path: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub deep_dim: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub pattern_dim: usize,
    /// 加入目录前图片所在的路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip)]
    pub schema: RecordSchema,
}

fn is_zero(x: &usize) -> bool {
    *x == 0
}

impl From<RawRecord> for CatalogEntry {
    fn from(raw: RawRecord) -> Self {
        let class_label = raw
            .class
            .or(raw.label)
            .or(raw.animal)
            .unwrap_or_else(|| "unknown".to_string());
        let image_path =
            raw.image_path.or(raw.crop_path).or(raw.path).or(raw.output_path).unwrap_or_default();
        let (deep_dim, pattern_dim, schema) = match (raw.deep_dim, raw.pattern_dim) {
            (Some(d), Some(p)) => (d, p, RecordSchema::Current),
            _ => (0, 0, RecordSchema::Legacy),
        };
        Self {
            id: raw.id.unwrap_or_default(),
            class_label,
            image_path,
            deep_dim,
            pattern_dim,
            source_path: raw.source_path,
            schema,
        }
    }
}

impl CatalogEntry {
    pub fn new(
        id: impl Into<String>,
        class_label: impl Into<String>,
        image_path: impl Into<String>,
        deep_dim: usize,
        pattern_dim: usize,
    ) -> Self {
        Self {
            id: id.into(),
            class_label: class_label.into(),
            image_path: image_path.into(),
            deep_dim,
            pattern_dim,
            source_path: None,
            schema: RecordSchema::Current,
        }
    }

    pub fn with_source_path(mut self, source_path: impl Into<String>) -> Self {
        self.source_path = Some(source_path.into());
        self
    }

    /// 归一化后的路径是否与该记录的图片或来源路径相同
    pub fn matches_path(&self, normalized: &str) -> bool {
        normalize_path(&self.image_path) == normalized
            || self.source_path.as_deref().is_some_and(|p| normalize_path(p) == normalized)
    }
}

/// 维度变化时目录经历的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    /// 磁盘上的索引维度与当前特征维度不一致
    Stale,
    /// 正在丢弃旧的索引与元数据
    Rebuilding,
    Ready,
}

impl fmt::Display for CatalogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => write!(f, "Stale"),
            Self::Rebuilding => write!(f, "Rebuilding"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// `load_all` 的结果，三个列表按目录顺序一一对应
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub vectors: Vec<Vec<f32>>,
    pub labels: Vec<String>,
    pub paths: Vec<String>,
}

#[derive(Debug)]
pub struct Catalog {
    conf_dir: ConfDir,
    index: AnyIndex,
    entries: Vec<CatalogEntry>,
    /// 原始融合向量，用于写入备份文件；备份不可用时为 None
    raw: Option<Vec<f32>>,
    state: CatalogState,
}

impl Catalog {
    /// 创建一个空目录并删除磁盘上的旧文件
    pub fn create(conf_dir: &ConfDir, dimension: usize, options: &IndexOptions) -> Result<Self> {
        for path in [conf_dir.index(), conf_dir.metadata(), conf_dir.embeddings_backup()] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(Self {
            conf_dir: conf_dir.clone(),
            index: AnyIndex::new(dimension, options),
            entries: vec![],
            raw: Some(vec![]),
            state: CatalogState::Ready,
        })
    }

    /// 打开维度为 dimension 的目录
    ///
    /// 磁盘上的索引维度不同时不会报错，而是丢弃旧的索引与元数据，创建空目录。
    pub fn create_or_open(
        conf_dir: &ConfDir,
        dimension: usize,
        options: &IndexOptions,
    ) -> Result<Self> {
        if !conf_dir.index().exists() {
            info!("目录不存在，创建 {:?} 索引，维度 {dimension}", options.index_kind);
            return Self::create(conf_dir, dimension, options);
        }

        let index = AnyIndex::load(conf_dir.index())?;
        if index.dimension() == dimension {
            return Self::from_index(conf_dir, index);
        }

        info!(
            "目录状态 {}：索引维度 {} 与当前特征维度 {dimension} 不一致",
            CatalogState::Stale,
            index.dimension()
        );
        info!("目录状态 {}：丢弃 {} 条旧记录及其索引", CatalogState::Rebuilding, index.ntotal());
        let catalog = Self::create(conf_dir, dimension, options)?;
        info!("目录状态 {}：已创建维度为 {dimension} 的空目录", catalog.state);
        Ok(catalog)
    }

    /// 打开已存在的目录
    pub fn open(conf_dir: &ConfDir) -> Result<Self> {
        if !conf_dir.index().exists() {
            return Err(ReidError::not_found("目录索引", conf_dir.index()));
        }
        let index = AnyIndex::load(conf_dir.index())?;
        Self::from_index(conf_dir, index)
    }

    fn from_index(conf_dir: &ConfDir, index: AnyIndex) -> Result<Self> {
        let metadata = conf_dir.metadata();
        if !metadata.exists() {
            return Err(ReidError::not_found("目录元数据", metadata));
        }
        let mut entries: Vec<CatalogEntry> = read_json(&metadata)?;
        for (i, entry) in entries.iter_mut().enumerate() {
            if entry.id.is_empty() {
                entry.id = format!("{}_{}", entry.class_label, i + 1);
            }
        }
        if index.ntotal() != entries.len() {
            return Err(ReidError::InconsistentCatalog {
                what: "索引向量与元数据",
                left: index.ntotal(),
                right: entries.len(),
            });
        }
        let legacy = entries.iter().filter(|e| e.schema == RecordSchema::Legacy).count();
        if legacy > 0 {
            warn!("{legacy} 条元数据缺少维度信息，按旧版本格式读取");
        }

        let raw = match reconstruct_all(&index) {
            Some(raw) => Some(raw),
            None => read_backup(conf_dir, &index)?,
        };
        debug!("打开目录：{} 条记录，维度 {}", entries.len(), index.dimension());
        Ok(Self {
            conf_dir: conf_dir.clone(),
            index,
            entries,
            raw,
            state: CatalogState::Ready,
        })
    }

    pub fn conf_dir(&self) -> &ConfDir {
        &self.conf_dir
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn index_kind(&self) -> IndexKind {
        self.index.kind()
    }

    pub fn state(&self) -> CatalogState {
        self.state
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 索引中的向量数量，总是与元数据数量相同
    pub fn ntotal(&self) -> usize {
        self.index.ntotal()
    }

    /// 每个类别的记录数量
    pub fn class_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.class_label.as_str()).or_default() += 1;
        }
        counts
    }

    /// 追加向量与对应的元数据
    ///
    /// 所有检查都在修改之前完成，索引与元数据要么一起增长，要么都不变。
    pub fn append(&mut self, vectors: &[Vec<f32>], entries: Vec<CatalogEntry>) -> Result<()> {
        if vectors.len() != entries.len() {
            return Err(ReidError::LengthMismatch {
                vectors: vectors.len(),
                records: entries.len(),
            });
        }
        let dimension = self.dimension();
        if let Some(v) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(ReidError::DimensionMismatch { expected: dimension, actual: v.len() });
        }
        if let Some(e) = entries.iter().find(|e| e.deep_dim + e.pattern_dim != dimension) {
            return Err(ReidError::DimensionMismatch {
                expected: dimension,
                actual: e.deep_dim + e.pattern_dim,
            });
        }
        if vectors.is_empty() {
            return Ok(());
        }

        let flat = vectors.concat();
        if !self.index.is_trained() {
            info!("使用 {} 组向量训练索引", vectors.len());
            self.index.train(&flat)?;
        }
        self.index.add(&flat)?;
        if let Some(raw) = self.raw.as_mut() {
            raw.extend_from_slice(&flat);
        }
        self.entries.extend(entries);
        debug_assert_eq!(self.index.ntotal(), self.entries.len());
        Ok(())
    }

    /// 写入索引、元数据与原始向量备份
    pub fn persist(&self) -> Result<()> {
        self.index.save(self.conf_dir.index())?;
        write_json(self.conf_dir.metadata(), &self.entries)?;

        let backup = self.conf_dir.embeddings_backup();
        match &self.raw {
            Some(raw) => {
                let array = Array2::from_shape_vec((self.len(), self.dimension()), raw.clone())?;
                ensure_parent(&backup)?;
                let tmp = tmp_path(&backup);
                write_npy(&tmp, &array)?;
                fs::rename(tmp, &backup)?;
            }
            None => {
                warn!("原始向量不可用，删除过期的备份文件 {}", backup.display());
                if backup.exists() {
                    fs::remove_file(&backup)?;
                }
            }
        }
        info!("目录已保存：{} 条记录", self.len());
        Ok(())
    }

    /// 取回全部向量及其类别与路径
    ///
    /// 索引无法还原原始向量时使用备份文件。
    pub fn load_all(&self) -> Result<CatalogSnapshot> {
        let d = self.dimension();
        let vectors = match (reconstruct_all(&self.index), &self.raw) {
            (Some(raw), _) => raw,
            (None, Some(raw)) => {
                debug!("索引无法还原向量，使用原始向量备份");
                raw.clone()
            }
            (None, None) => {
                return Err(ReidError::not_found("原始向量备份", self.conf_dir.embeddings_backup()));
            }
        };
        Ok(CatalogSnapshot {
            vectors: vectors.chunks_exact(d.max(1)).map(|v| v.to_vec()).collect(),
            labels: self.entries.iter().map(|e| e.class_label.clone()).collect(),
            paths: self.entries.iter().map(|e| e.image_path.clone()).collect(),
        })
    }

    /// 搜索 k 个最近邻，返回距离与位置，不足 k 个时用 `(INFINITY, -1)` 填充
    pub fn search(&self, query: &[f32], k: usize) -> Result<(Vec<f32>, Vec<i64>)> {
        if query.len() != self.dimension() {
            return Err(ReidError::DimensionMismatch {
                expected: self.dimension(),
                actual: query.len(),
            });
        }
        let neighbors = self.index.search(query, k)?;
        let mut distances = Vec::with_capacity(k);
        let mut indices = Vec::with_capacity(k);
        for n in neighbors.iter().take(k) {
            distances.push(n.distance);
            indices.push(n.id);
        }
        distances.resize(k, f32::INFINITY);
        indices.resize(k, -1);
        Ok((distances, indices))
    }

    /// 最近邻在目录中的位置，目录为空时返回 None
    ///
    /// 倒排索引探查到的列表可能都是空的，此时对原始向量做穷举搜索。
    pub fn nearest(&self, query: &[f32]) -> Result<Option<usize>> {
        let (_, indices) = self.search(query, 1)?;
        if let Some(i) = indices.first().and_then(|i| usize::try_from(*i).ok()) {
            return Ok(Some(i));
        }
        if self.is_empty() {
            return Ok(None);
        }
        let Some(raw) = &self.raw else {
            return Err(ReidError::not_found("原始向量备份", self.conf_dir.embeddings_backup()));
        };
        debug!("索引没有返回近邻，对 {} 条原始向量穷举搜索", self.len());
        let metric = self.index.metric();
        Ok(raw
            .chunks_exact(self.dimension().max(1))
            .map(|v| distance(metric, query, v))
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i))
    }

    /// 图片路径是否已经在目录中，比较前忽略大小写与路径分隔符
    pub fn contains_path(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.entries.iter().any(|e| e.matches_path(&normalized))
    }

    /// 下一条记录的编号
    pub fn next_id(&self, class_label: &str) -> String {
        format!("{}_{}", class_label, self.len() + 1)
    }
}

/// 从索引中还原全部向量，有损索引返回 None
fn reconstruct_all(index: &AnyIndex) -> Option<Vec<f32>> {
    let mut raw = Vec::with_capacity(index.ntotal() * index.dimension());
    for i in 0..index.ntotal() {
        raw.extend(index.reconstruct(i)?);
    }
    Some(raw)
}

/// 读取原始向量备份，只有行数与索引一致时才使用
fn read_backup(conf_dir: &ConfDir, index: &AnyIndex) -> Result<Option<Vec<f32>>> {
    let path = conf_dir.embeddings_backup();
    if !path.exists() {
        warn!("原始向量备份不存在：{}", path.display());
        return Ok(None);
    }
    let array: Array2<f32> = read_npy(&path)?;
    if array.nrows() != index.ntotal() || array.ncols() != index.dimension() {
        warn!(
            "原始向量备份的形状 {:?} 与索引 ({}, {}) 不一致，忽略备份",
            array.shape(),
            index.ntotal(),
            index.dimension()
        );
        return Ok(None);
    }
    Ok(Some(array.into_iter().collect()))
}
