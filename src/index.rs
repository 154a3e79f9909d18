//! 融合向量的相似度索引

mod flat;
mod ivf;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub use flat::FlatIndex;
pub use ivf::IvfIndex;
use serde::{Deserialize, Serialize};

use crate::config::{IndexKind, IndexOptions, Metric};
use crate::error::Result;
use crate::utils::{cosine_similarity, ensure_parent, l2_distance_sq, tmp_path};

/// 搜索结果，id 为向量在索引中的位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: i64,
    pub distance: f32,
}

impl Default for Neighbor {
    fn default() -> Self {
        Self { id: -1, distance: f32::INFINITY }
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 距离相同时序号小的排在前面
impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.id.cmp(&other.id))
    }
}

/// 保留距离最小的 k 个结果
pub struct TopKNeighbors {
    heap: BinaryHeap<Neighbor>,
    k: usize,
}

impl TopKNeighbors {
    pub fn new(k: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(k + 1), k }
    }

    pub fn push(&mut self, neighbor: Neighbor) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(neighbor);
        } else if self.heap.peek().is_some_and(|top| neighbor < *top) {
            self.heap.pop();
            self.heap.push(neighbor);
        }
    }

    pub fn extend(&mut self, neighbors: impl IntoIterator<Item = Neighbor>) {
        neighbors.into_iter().for_each(|n| self.push(n));
    }

    /// 按距离从小到大返回
    pub fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

/// 按照度量计算两个向量的距离
#[inline]
pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::L2 => l2_distance_sq(a, b),
        Metric::Cosine => 1.0 - cosine_similarity(a, b),
    }
}

/// 向量索引的统一接口
///
/// 向量按照插入顺序编号，编号与目录元数据的位置一一对应。
pub trait VectorIndex {
    /// 向量维度
    fn dimension(&self) -> usize;

    fn metric(&self) -> Metric;

    /// 索引中的向量数量
    fn ntotal(&self) -> usize;

    /// 是否可以直接添加向量
    fn is_trained(&self) -> bool;

    /// 使用展平的 n * d 数组训练索引
    fn train(&mut self, x: &[f32]) -> Result<()>;

    /// 追加展平的 n * d 数组
    fn add(&mut self, x: &[f32]) -> Result<()>;

    /// 返回最多 k 个最近邻，按距离从小到大排列
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// 取回原始向量，有损编码的索引返回 None
    fn reconstruct(&self, id: usize) -> Option<Vec<f32>>;
}

/// 持久化到 `catalog.index` 的索引
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnyIndex {
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

impl AnyIndex {
    pub fn new(dimension: usize, options: &IndexOptions) -> Self {
        match options.index_kind {
            IndexKind::Flat => Self::Flat(FlatIndex::new(dimension, options.metric)),
            IndexKind::Ivf => Self::Ivf(IvfIndex::new(
                dimension,
                options.metric,
                options.nlist,
                options.nprobe,
            )),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Flat(_) => IndexKind::Flat,
            Self::Ivf(_) => IndexKind::Ivf,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        ensure_parent(path)?;
        let tmp = tmp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn inner(&self) -> &dyn VectorIndex {
        match self {
            Self::Flat(index) => index,
            Self::Ivf(index) => index,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn VectorIndex {
        match self {
            Self::Flat(index) => index,
            Self::Ivf(index) => index,
        }
    }
}

impl VectorIndex for AnyIndex {
    fn dimension(&self) -> usize {
        self.inner().dimension()
    }

    fn metric(&self) -> Metric {
        self.inner().metric()
    }

    fn ntotal(&self) -> usize {
        self.inner().ntotal()
    }

    fn is_trained(&self) -> bool {
        self.inner().is_trained()
    }

    fn train(&mut self, x: &[f32]) -> Result<()> {
        self.inner_mut().train(x)
    }

    fn add(&mut self, x: &[f32]) -> Result<()> {
        self.inner_mut().add(x)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.inner().search(query, k)
    }

    fn reconstruct(&self, id: usize) -> Option<Vec<f32>> {
        self.inner().reconstruct(id)
    }
}
