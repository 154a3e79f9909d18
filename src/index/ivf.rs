use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Neighbor, TopKNeighbors, VectorIndex, distance};
use crate::config::Metric;
use crate::error::{ReidError, Result};
use crate::kmeans::{imbalance_factor, nearest_centroid, train_centroids};
use crate::utils::l2_distance_sq;

const KMEANS_MAX_ITER: usize = 25;

/// 单个倒排列表
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InvertedList {
    ids: Vec<u64>,
    codes: Vec<u8>,
}

/// 倒排索引
///
/// 使用 k-means 聚类中心作为粗量化器，向量按维度做 8 bit 标量量化后存入倒排列表。
/// 量化是有损的，因此无法取回原始向量。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    dimension: usize,
    metric: Metric,
    nlist: usize,
    nprobe: usize,
    /// 聚类中心，展平的 nlist * d 数组，未训练时为空
    centroids: Vec<f32>,
    /// 每个维度的最小值
    vmin: Vec<f32>,
    /// 每个维度的取值范围
    vdiff: Vec<f32>,
    lists: Vec<InvertedList>,
    ntotal: usize,
}

impl IvfIndex {
    pub fn new(dimension: usize, metric: Metric, nlist: usize, nprobe: usize) -> Self {
        Self {
            dimension,
            metric,
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            centroids: vec![],
            vmin: vec![],
            vdiff: vec![],
            lists: vec![],
            ntotal: 0,
        }
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.nprobe = nprobe.max(1);
    }

    fn encode(&self, x: &[f32]) -> Vec<u8> {
        x.iter()
            .zip(self.vmin.iter().zip(&self.vdiff))
            .map(|(x, (vmin, vdiff))| {
                if *vdiff == 0.0 {
                    return 0;
                }
                ((x - vmin) / vdiff * 255.0).round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    fn decode(&self, code: &[u8]) -> Vec<f32> {
        code.iter()
            .zip(self.vmin.iter().zip(&self.vdiff))
            .map(|(c, (vmin, vdiff))| vmin + *c as f32 / 255.0 * vdiff)
            .collect()
    }

    /// 返回距离 x 最近的 n 个倒排列表序号
    fn probe_lists(&self, x: &[f32], n: usize) -> Vec<usize> {
        let mut lists = self
            .centroids
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, c)| (i, l2_distance_sq(x, c)))
            .collect::<Vec<_>>();
        lists.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        lists.into_iter().take(n).map(|(i, _)| i).collect()
    }

    fn check_width(&self, len: usize) -> Result<()> {
        if self.dimension == 0 || len % self.dimension != 0 {
            return Err(ReidError::DimensionMismatch { expected: self.dimension, actual: len });
        }
        Ok(())
    }
}

impl VectorIndex for IvfIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn ntotal(&self) -> usize {
        self.ntotal
    }

    fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn train(&mut self, x: &[f32]) -> Result<()> {
        self.check_width(x.len())?;
        let n = x.len() / self.dimension;
        if n == 0 {
            return Ok(());
        }
        if self.is_trained() {
            warn!("倒排索引已经训练过，忽略本次训练");
            return Ok(());
        }
        if n < self.nlist {
            warn!("训练向量数量 {n} 少于聚类中心数量 {}，聚类中心数量调整为 {n}", self.nlist);
            self.nlist = n;
        }

        info!("对 {n} 组向量进行聚类，中心点数量 = {}", self.nlist);
        let (centroids, frequency) = train_centroids(x, self.dimension, self.nlist, KMEANS_MAX_ITER);
        if centroids.len() != self.nlist * self.dimension {
            return Err(ReidError::DimensionMismatch {
                expected: self.nlist * self.dimension,
                actual: centroids.len(),
            });
        }
        info!("聚类完成，不平衡度：{:.2}", imbalance_factor(&frequency));
        self.centroids = centroids;
        self.lists = vec![InvertedList::default(); self.nlist];

        // 标量量化的取值范围
        let d = self.dimension;
        let mut vmin = vec![f32::INFINITY; d];
        let mut vmax = vec![f32::NEG_INFINITY; d];
        for v in x.chunks_exact(d) {
            for (j, x) in v.iter().enumerate() {
                vmin[j] = vmin[j].min(*x);
                vmax[j] = vmax[j].max(*x);
            }
        }
        self.vdiff = vmax.iter().zip(&vmin).map(|(max, min)| max - min).collect();
        self.vmin = vmin;
        Ok(())
    }

    fn add(&mut self, x: &[f32]) -> Result<()> {
        self.check_width(x.len())?;
        if !self.is_trained() {
            self.train(x)?;
        }
        let d = self.dimension;
        let assignments = x
            .par_chunks_exact(d)
            .map(|v| nearest_centroid(v, &self.centroids, d).0)
            .collect::<Vec<_>>();
        for (v, list_no) in x.chunks_exact(d).zip(assignments) {
            let code = self.encode(v);
            let list = &mut self.lists[list_no];
            list.ids.push(self.ntotal as u64);
            list.codes.extend(code);
            self.ntotal += 1;
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(ReidError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if !self.is_trained() {
            return Ok(vec![]);
        }
        let mut topk = TopKNeighbors::new(k);
        for list_no in self.probe_lists(query, self.nprobe) {
            let list = &self.lists[list_no];
            let neighbors = list.ids.iter().zip(list.codes.chunks_exact(self.dimension)).map(
                |(id, code)| Neighbor {
                    id: *id as i64,
                    distance: distance(self.metric, query, &self.decode(code)),
                },
            );
            topk.extend(neighbors);
        }
        Ok(topk.into_sorted_vec())
    }

    fn reconstruct(&self, _id: usize) -> Option<Vec<f32>> {
        None
    }
}
