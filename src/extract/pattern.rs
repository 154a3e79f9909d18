//! 内置纹理特征：RGB 颜色直方图 + 均匀 LBP 直方图 + GLCM 纹理统计

use std::f32::consts::PI;
use std::path::Path;

use image::{GrayImage, Luma, RgbImage, imageops};

use crate::error::{ReidError, Result};
use crate::extract::FeatureExtractor;

/// 每个颜色通道的直方图柱数
const COLOR_HIST_BINS: usize = 48;
/// LBP 采样半径
const LBP_RADIUS: f32 = 3.0;
/// LBP 采样点数量
const LBP_POINTS: usize = 24;
/// GLCM 的灰度级数
const GLCM_LEVELS: usize = 16;
const GLCM_DISTANCES: [f32; 2] = [1.0, 2.0];
const GLCM_ANGLES: [f32; 4] = [0.0, PI / 4.0, PI / 2.0, 3.0 * PI / 4.0];

/// 纹理特征的维度：3 * 48 + 26 + 2 * 4 * 4
pub const PATTERN_DIM: usize =
    3 * COLOR_HIST_BINS + LBP_POINTS + 2 + GLCM_DISTANCES.len() * GLCM_ANGLES.len() * 4;

pub struct PatternExtractor;

impl FeatureExtractor for PatternExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).map_err(|e| ReidError::extraction(path, e))?.to_rgb8();
        if img.width() == 0 || img.height() == 0 {
            return Err(ReidError::extraction(path, "图片为空"));
        }
        Ok(pattern_features(&img))
    }

    fn dim(&self) -> Option<usize> {
        Some(PATTERN_DIM)
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

/// 越界时返回 None
#[inline]
fn pixel(gray: &GrayImage, r: isize, c: isize) -> Option<u8> {
    let (x, y) = (u32::try_from(c).ok()?, u32::try_from(r).ok()?);
    gray.get_pixel_checked(x, y).map(|p| p.0[0])
}

pub fn pattern_features(img: &RgbImage) -> Vec<f32> {
    let gray = imageops::grayscale(img);
    let mut features = Vec::with_capacity(PATTERN_DIM);
    features.extend(color_histogram(img));
    features.extend(lbp_histogram(&gray));
    features.extend(glcm_features(&gray));
    features
}

fn normalize_hist(hist: &[u64]) -> impl Iterator<Item = f32> + '_ {
    let total = hist.iter().sum::<u64>() as f32 + 1e-6;
    hist.iter().map(move |h| *h as f32 / total)
}

fn color_histogram(img: &RgbImage) -> Vec<f32> {
    let mut hist = [[0u64; COLOR_HIST_BINS]; 3];
    for p in img.pixels() {
        for (ch, v) in p.0.iter().enumerate() {
            hist[ch][*v as usize * COLOR_HIST_BINS / 256] += 1;
        }
    }
    hist.iter().flat_map(|h| normalize_hist(h).collect::<Vec<_>>()).collect()
}

/// 双线性插值，越界的像素按 0 处理
fn bilinear(gray: &GrayImage, r: f32, c: f32) -> f32 {
    let (r0, c0) = (r.floor(), c.floor());
    let (dr, dc) = (r - r0, c - c0);
    let (r0, c0) = (r0 as isize, c0 as isize);
    let px = |r, c| pixel(gray, r, c).unwrap_or(0) as f32;
    let top = (1.0 - dc) * px(r0, c0) + dc * px(r0, c0 + 1);
    let bottom = (1.0 - dc) * px(r0 + 1, c0) + dc * px(r0 + 1, c0 + 1);
    (1.0 - dr) * top + dr * bottom
}

/// 旋转不变的均匀 LBP 直方图，共 P + 2 个柱
fn lbp_histogram(gray: &GrayImage) -> Vec<f32> {
    // 采样点相对中心的偏移，保留 5 位小数以消除浮点误差
    let round5 = |x: f32| (x * 1e5).round() / 1e5;
    let offsets = (0..LBP_POINTS)
        .map(|p| {
            let angle = 2.0 * PI * p as f32 / LBP_POINTS as f32;
            (round5(-LBP_RADIUS * angle.sin()), round5(LBP_RADIUS * angle.cos()))
        })
        .collect::<Vec<_>>();

    let mut hist = vec![0u64; LBP_POINTS + 2];
    let mut signs = vec![false; LBP_POINTS];
    for (c, r, center) in gray.enumerate_pixels() {
        let center = center.0[0] as f32;
        for (s, (dr, dc)) in signs.iter_mut().zip(&offsets) {
            *s = bilinear(gray, r as f32 + dr, c as f32 + dc) >= center;
        }
        let changes = signs.windows(2).filter(|w| w[0] != w[1]).count();
        let code = if changes <= 2 {
            signs.iter().filter(|s| **s).count()
        } else {
            LBP_POINTS + 1
        };
        hist[code] += 1;
    }
    normalize_hist(&hist).collect()
}

/// 每组距离与角度的 GLCM 统计量：对比度、相异性、同质性、能量
fn glcm_features(gray: &GrayImage) -> Vec<f32> {
    let step = (256 / GLCM_LEVELS) as u8;
    let levels = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y).0[0] / step])
    });

    let mut features = vec![];
    for distance in GLCM_DISTANCES {
        for angle in GLCM_ANGLES {
            let dr = (angle.sin() * distance).round() as isize;
            let dc = (angle.cos() * distance).round() as isize;
            features.extend(glcm_props(&glcm(&levels, dr, dc)));
        }
    }
    features
}

/// 对称且归一化的共生矩阵
fn glcm(levels: &GrayImage, dr: isize, dc: isize) -> Vec<f32> {
    let mut counts = vec![0u64; GLCM_LEVELS * GLCM_LEVELS];
    for r in 0..levels.height() as isize {
        for c in 0..levels.width() as isize {
            let (Some(i), Some(j)) = (pixel(levels, r, c), pixel(levels, r + dr, c + dc)) else {
                continue;
            };
            let (i, j) = (i as usize, j as usize);
            counts[i * GLCM_LEVELS + j] += 1;
            counts[j * GLCM_LEVELS + i] += 1;
        }
    }
    let total = counts.iter().sum::<u64>();
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    counts.iter().map(|c| *c as f32 / total as f32).collect()
}

fn glcm_props(p: &[f32]) -> [f32; 4] {
    let (mut contrast, mut dissimilarity, mut homogeneity, mut asm) = (0.0, 0.0, 0.0, 0.0);
    for i in 0..GLCM_LEVELS {
        for j in 0..GLCM_LEVELS {
            let v = p[i * GLCM_LEVELS + j];
            let diff = i as f32 - j as f32;
            contrast += v * diff * diff;
            dissimilarity += v * diff.abs();
            homogeneity += v / (1.0 + diff * diff);
            asm += v * v;
        }
    }
    [contrast, dissimilarity, homogeneity, asm.sqrt()]
}
