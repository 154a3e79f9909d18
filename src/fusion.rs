//! 融合特征：深度特征与纹理特征各自归一化后拼接

use log::{info, warn};
use serde::Serialize;

use crate::error::{ReidError, Result};
use crate::store::FeatureStore;
use crate::utils::l2_norm;

/// 归一化时防止除零的常量
pub const NORM_EPS: f32 = 1e-8;

/// 融合向量，前半段为深度特征，后半段为纹理特征
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedVector {
    data: Vec<f32>,
    deep_dim: usize,
    pattern_dim: usize,
}

impl FusedVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn deep_dim(&self) -> usize {
        self.deep_dim
    }

    pub fn pattern_dim(&self) -> usize {
        self.pattern_dim
    }

    /// 归一化后的深度特征段
    pub fn deep(&self) -> &[f32] {
        &self.data[..self.deep_dim]
    }

    /// 归一化后的纹理特征段
    pub fn pattern(&self) -> &[f32] {
        &self.data[self.deep_dim..]
    }
}

/// 返回 `v / (||v|| + eps)`
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v) + NORM_EPS;
    v.iter().map(|x| x / norm).collect()
}

/// 融合两个特征向量
///
/// 两段各自归一化后按「深度在前、纹理在后」拼接，拼接后不再整体归一化。
/// 顺序是固定约定，颠倒会使已有的目录与分类器全部失效。
pub fn fuse(deep: &[f32], pattern: &[f32]) -> FusedVector {
    let mut data = l2_normalize(deep);
    data.extend(l2_normalize(pattern));
    FusedVector { data, deep_dim: deep.len(), pattern_dim: pattern.len() }
}

/// 对齐后的一条记录，两段特征来自同一个键
#[derive(Debug, Clone)]
pub struct AlignedRecord {
    pub key: String,
    pub image_path: String,
    pub class_label: String,
    pub deep: Vec<f32>,
    pub pattern: Vec<f32>,
}

impl AlignedRecord {
    pub fn fused(&self) -> FusedVector {
        fuse(&self.deep, &self.pattern)
    }
}

/// 两个特征库按键内连接的结果
#[derive(Debug, Clone, Default)]
pub struct Alignment {
    pub records: Vec<AlignedRecord>,
    /// 只在深度特征库中出现的键数量
    pub dropped_deep: usize,
    /// 只在纹理特征库中出现的键数量
    pub dropped_pattern: usize,
}

impl Alignment {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped_deep + self.dropped_pattern
    }
}

/// 按文件名键对齐深度特征库与纹理特征库
///
/// 只保留两边都存在的键，输出顺序与纹理特征库一致。
/// 同一个库中重复的键以最后一次出现为准。
pub fn align(deep: &FeatureStore, pattern: &FeatureStore) -> Result<Alignment> {
    let deep_map = deep.key_index();
    let pattern_map = pattern.key_index();

    let mut records = vec![];
    for (i, record) in pattern.records().iter().enumerate() {
        if pattern_map.get(record.key.as_str()) != Some(&i) {
            continue;
        }
        let Some(&j) = deep_map.get(record.key.as_str()) else {
            continue;
        };
        records.push(AlignedRecord {
            key: record.key.clone(),
            image_path: record.image_path.clone(),
            class_label: record.class_label.clone(),
            deep: deep.vector(j).to_vec(),
            pattern: pattern.vector(i).to_vec(),
        });
    }

    if records.is_empty() {
        return Err(ReidError::Alignment { deep: deep.len(), pattern: pattern.len() });
    }

    let alignment = Alignment {
        dropped_deep: deep_map.len() - records.len(),
        dropped_pattern: pattern_map.len() - records.len(),
        records,
    };
    if alignment.dropped() > 0 {
        warn!(
            "{} 张裁剪图只存在于其中一个特征库，已从检索集合中去除（仅深度 {}，仅纹理 {}）",
            alignment.dropped(),
            alignment.dropped_deep,
            alignment.dropped_pattern
        );
    }
    info!("已对齐 {} 张同时具有两种特征的裁剪图", alignment.len());
    Ok(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FeatureRecord;

    fn store(name: &str, items: &[(&str, [f32; 2])]) -> FeatureStore {
        let mut s = FeatureStore::new(name);
        for (path, v) in items {
            s.push(FeatureRecord::new(*path, "tiger"), v).unwrap();
        }
        s
    }

    #[test]
    fn test_fuse_normalizes_each_segment() {
        let fused = fuse(&[3.0, 4.0], &[0.0, 0.0, 2.0]);
        assert_eq!(fused.len(), 5);
        assert_eq!(fused.deep_dim(), 2);
        assert_eq!(fused.pattern_dim(), 3);
        assert!((fused.deep()[0] - 0.6).abs() < 1e-6);
        assert!((fused.deep()[1] - 0.8).abs() < 1e-6);
        assert!((fused.pattern()[2] - 1.0).abs() < 1e-6);
        // 整体范数约为 sqrt(2)，说明没有在拼接后再次归一化
        assert!((l2_norm(fused.as_slice()) - 2f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_fuse_zero_vector() {
        let fused = fuse(&[0.0, 0.0], &[1.0]);
        assert!(fused.as_slice().iter().all(|x| x.is_finite()));
        assert_eq!(fused.deep(), &[0.0, 0.0]);
    }

    #[test]
    fn test_fuse_deterministic_and_ordered() {
        let d = [1.0, 2.0, 3.0];
        let p = [5.0, -1.0, 0.5];
        assert_eq!(fuse(&d, &p), fuse(&d, &p));
        assert_ne!(fuse(&d, &p).as_slice(), fuse(&p, &d).as_slice());
    }

    #[test]
    fn test_align_intersection() {
        let deep = store(
            "deep",
            &[("a/x1.jpg", [1.0, 0.0]), ("a/x2.jpg", [2.0, 0.0]), ("a/x3.jpg", [3.0, 0.0])],
        );
        let pattern = store(
            "pattern",
            &[("b/x3.png", [0.0, 3.0]), ("b/x4.png", [0.0, 4.0]), ("b/x1.png", [0.0, 1.0])],
        );
        let alignment = align(&deep, &pattern).unwrap();
        assert_eq!(alignment.len(), 2);
        assert_eq!(alignment.dropped_deep, 1);
        assert_eq!(alignment.dropped_pattern, 1);
        // 顺序与纹理特征库一致
        assert_eq!(alignment.records[0].key, "x3");
        assert_eq!(alignment.records[1].key, "x1");
        for r in &alignment.records {
            let n: f32 = r.key[1..].parse().unwrap();
            assert_eq!(r.deep[0], n);
            assert_eq!(r.pattern[1], n);
            assert!(r.image_path.starts_with("b/"));
        }
    }

    #[test]
    fn test_align_duplicate_key_uses_last() {
        let deep = store("deep", &[("x1.jpg", [1.0, 0.0]), ("other/x1.jpg", [9.0, 0.0])]);
        let pattern = store("pattern", &[("x1.jpg", [0.0, 1.0])]);
        let alignment = align(&deep, &pattern).unwrap();
        assert_eq!(alignment.len(), 1);
        assert_eq!(alignment.records[0].deep[0], 9.0);
    }

    #[test]
    fn test_align_empty_intersection() {
        let deep = store("deep", &[("x1.jpg", [1.0, 0.0])]);
        let pattern = store("pattern", &[("x2.jpg", [0.0, 1.0])]);
        assert!(matches!(align(&deep, &pattern), Err(ReidError::Alignment { .. })));
    }
}
