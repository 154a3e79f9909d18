use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Neighbor, TopKNeighbors, VectorIndex, distance};
use crate::config::Metric;
use crate::error::{ReidError, Result};

/// 精确搜索的索引，原样保存全部向量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: usize,
    metric: Metric,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self { dimension, metric, data: vec![] }
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn ntotal(&self) -> usize {
        if self.dimension == 0 { 0 } else { self.data.len() / self.dimension }
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn train(&mut self, _x: &[f32]) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, x: &[f32]) -> Result<()> {
        if self.dimension == 0 || x.len() % self.dimension != 0 {
            return Err(ReidError::DimensionMismatch { expected: self.dimension, actual: x.len() });
        }
        self.data.extend_from_slice(x);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(ReidError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let neighbors = self
            .data
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, v)| Neighbor { id: i as i64, distance: distance(self.metric, query, v) })
            .collect::<Vec<_>>();
        let mut topk = TopKNeighbors::new(k);
        topk.extend(neighbors);
        Ok(topk.into_sorted_vec())
    }

    fn reconstruct(&self, id: usize) -> Option<Vec<f32>> {
        let d = self.dimension;
        self.data.get(id * d..(id + 1) * d).map(|v| v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_search_l2() {
        let mut index = FlatIndex::new(2, Metric::L2);
        index.add(&[0.0, 0.0, 1.0, 0.0, 5.0, 5.0]).unwrap();
        let result = index.search(&[0.9, 0.0], 2).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, 1);
        assert_eq!(result[1].id, 0);
        assert!((result[0].distance - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_flat_search_cosine() {
        let mut index = FlatIndex::new(2, Metric::Cosine);
        index.add(&[10.0, 0.0, 0.0, 1.0]).unwrap();
        let result = index.search(&[0.1, 1.0], 1).unwrap();
        assert_eq!(result[0].id, 1);
    }

    #[test]
    fn test_flat_rejects_wrong_width() {
        let mut index = FlatIndex::new(3, Metric::L2);
        assert!(matches!(index.add(&[1.0, 2.0]), Err(ReidError::DimensionMismatch { .. })));
        assert!(matches!(index.search(&[1.0], 1), Err(ReidError::DimensionMismatch { .. })));
        assert_eq!(index.ntotal(), 0);
    }

    #[test]
    fn test_flat_reconstruct() {
        let mut index = FlatIndex::new(2, Metric::L2);
        index.add(&[1.0, 2.0]).unwrap();
        assert_eq!(index.reconstruct(0), Some(vec![1.0, 2.0]));
        assert_eq!(index.reconstruct(1), None);
    }
}
