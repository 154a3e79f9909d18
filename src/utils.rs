use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use indicatif::ProgressStyle;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use walkdir::WalkDir;

use crate::error::Result;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("invalid progress template")
        .progress_chars("#>-")
}

/// 路径比较前的归一化：统一分隔符并转为小写
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// 用于对齐两个特征库的键，即不含目录与扩展名的文件名
pub fn stem_key(path: impl AsRef<Path>) -> String {
    path.as_ref().file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

/// 计算文件的 blake3 哈希
pub fn hash_file(path: impl AsRef<Path>) -> Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// 构建后缀名匹配的正则，如 `jpg,png` => `(?i)^(jpg|png)$`
pub fn suffix_regex(suffix: &str) -> Regex {
    let alternatives = suffix.split(',').map(regex::escape).collect::<Vec<_>>().join("|");
    let re = format!("(?i)^({alternatives})$");
    Regex::new(&re).expect("failed to build regex")
}

/// 递归扫描目录下的图片，按路径排序以保证结果稳定
pub fn scan_images(dir: impl AsRef<Path>, re_suf: &Regex) -> Vec<PathBuf> {
    let mut entries = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension().map(|ext| re_suf.is_match(&ext.to_string_lossy())).unwrap_or(false)
        })
        .collect::<Vec<_>>();
    entries.sort();
    entries
}

pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// 先写入临时文件再重命名，避免写入中途崩溃留下半个文件
pub fn write_json<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let tmp = tmp_path(path);
    ensure_parent(path)?;
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    fs::rename(tmp, path)?;
    Ok(())
}

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 余弦相似度，零向量的相似度为 0
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = l2_norm(a) * l2_norm(b);
    if denom == 0.0 { 0.0 } else { dot(a, b) / denom }
}

#[inline]
pub fn l2_distance_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 保留三位小数
pub fn round3(x: f32) -> f32 {
    (x * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(r"D:\Crops\Tiger\A.JPG"), "d:/crops/tiger/a.jpg");
    }

    #[test]
    fn test_stem_key() {
        assert_eq!(stem_key("crops/tiger/tiger_001.jpg"), "tiger_001");
        assert_eq!(stem_key("tiger_001"), "tiger_001");
    }

    #[test]
    fn test_suffix_regex() {
        let re = suffix_regex("jpg,png");
        assert!(re.is_match("JPG"));
        assert!(re.is_match("png"));
        assert!(!re.is_match("jpgx"));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.4), 0.4);
        assert_eq!(round3(2.0 / 3.0), 0.667);
    }
}
