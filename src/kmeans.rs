use kmeans::{EuclideanDistance, KMeans, KMeansConfig, KMeansState};
use log::debug;

use crate::utils::l2_distance_sq;

/// 聚类的不平衡度，1 表示完全平衡，越大表示越不平衡
pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    if tot == 0.0 {
        return 0.0;
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}

/// 使用 Lloyd K-means 聚类，返回展平的 k * d 聚类中心与每个中心包含的向量数量
///
/// 参数：
/// - data: 输入向量，展平的 n * d 数组
/// - d: 向量维度
/// - k: 聚类中心数量，超过向量数量时按向量数量计算
/// - max_iter: 最大迭代次数
pub fn train_centroids(data: &[f32], d: usize, k: usize, max_iter: usize) -> (Vec<f32>, Vec<usize>) {
    let n = if d == 0 { 0 } else { data.len() / d };
    if n == 0 || k == 0 {
        return (vec![], vec![]);
    }
    let k = k.min(n);

    let samples = data[..n * d].to_vec();
    let km: KMeans<_, 16, _> = KMeans::new(&samples, n, d, EuclideanDistance);
    let conf = KMeansConfig::build()
        .iteration_done(&|s: &KMeansState<f32>, nr: usize, new_distsum: f32| {
            debug!(
                "第 {} 轮 - 不平衡度：{:.2} | 距离和变化：{:+.2}",
                nr,
                imbalance_factor(&s.centroid_frequency),
                new_distsum - s.distsum
            );
        })
        .build();
    // NOTE: init_kmeanplusplus 会 panic
    let result = km.kmeans_lloyd(k, max_iter, KMeans::init_random_partition, &conf);

    // 维度不是 16 的倍数时，聚类中心可能带有对齐用的填充
    let centroids = result.centroids.to_vec();
    let stride = centroids.len() / k;
    let centroids = if stride > d {
        centroids.chunks_exact(stride).flat_map(|c| c[..d].iter().copied()).collect()
    } else {
        centroids
    };
    (centroids, result.centroid_frequency.to_vec())
}

/// 返回与 x 最近的聚类中心序号
pub fn nearest_centroid(x: &[f32], centroids: &[f32], d: usize) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (j, centroid) in centroids.chunks_exact(d).enumerate() {
        let distance = l2_distance_sq(x, centroid);
        if distance < best.1 {
            best = (j, distance);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<f32> {
        let mut data = vec![];
        for i in 0..20 {
            let e = i as f32 * 0.01;
            data.extend([0.0 + e, 0.0 - e]);
            data.extend([10.0 - e, 10.0 + e]);
        }
        data
    }

    #[test]
    fn test_train_centroids_separates_blobs() {
        let data = two_blobs();
        let (centroids, frequency) = train_centroids(&data, 2, 2, 50);
        assert_eq!(centroids.len(), 4);
        assert_eq!(frequency.iter().sum::<usize>(), 40);
        let (a, _) = nearest_centroid(&[0.0, 0.0], &centroids, 2);
        let (b, _) = nearest_centroid(&[10.0, 10.0], &centroids, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_train_centroids_single_cluster() {
        let data = vec![3.0; 8 * 5];
        let (centroids, _) = train_centroids(&data, 5, 1, 10);
        assert_eq!(centroids, vec![3.0; 5]);
    }

    #[test]
    fn test_train_centroids_k_clamped() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let (centroids, _) = train_centroids(&data, 2, 5, 10);
        assert_eq!(centroids.len(), 4);
        assert!(train_centroids(&[], 2, 5, 10).0.is_empty());
    }

    #[test]
    fn test_nearest_centroid() {
        let centroids = [0.0, 0.0, 5.0, 5.0];
        assert_eq!(nearest_centroid(&[4.0, 6.0], &centroids, 2), (1, 2.0));
    }

    #[test]
    fn test_imbalance_factor() {
        assert_eq!(imbalance_factor(&[5, 5]), 1.0);
        assert!(imbalance_factor(&[9, 1]) > 1.0);
        assert_eq!(imbalance_factor(&[]), 0.0);
    }
}
