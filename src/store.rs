//! 按来源（深度 / 纹理）分别保存的特征库

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};

use crate::error::{ReidError, Result};
use crate::utils::{ensure_parent, read_json, stem_key, tmp_path, write_json};

/// 特征库中的一条记录，与特征矩阵的行一一对应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// 对齐用的键，即图片的文件名（不含扩展名）
    pub key: String,
    pub image_path: String,
    #[serde(rename = "class")]
    pub class_label: String,
}

impl FeatureRecord {
    pub fn new(image_path: impl AsRef<Path>, class_label: impl Into<String>) -> Self {
        let image_path = image_path.as_ref();
        Self {
            key: stem_key(image_path),
            image_path: image_path.to_string_lossy().into_owned(),
            class_label: class_label.into(),
        }
    }
}

/// 特征库，保存为 `<name>.npy` 与 `<name>.json` 两个文件
#[derive(Debug, Clone)]
pub struct FeatureStore {
    name: String,
    dim: usize,
    records: Vec<FeatureRecord>,
    data: Vec<f32>,
}

impl FeatureStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), dim: 0, records: vec![], data: vec![] }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 特征维度，空库为 0
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    pub fn vector(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// 追加一条记录，第一条记录决定特征维度
    pub fn push(&mut self, record: FeatureRecord, vector: &[f32]) -> Result<()> {
        if self.records.is_empty() && self.dim == 0 {
            self.dim = vector.len();
        }
        if vector.len() != self.dim {
            return Err(ReidError::DimensionMismatch { expected: self.dim, actual: vector.len() });
        }
        self.records.push(record);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// 按键查找特征，重复的键以最后一次出现为准
    pub fn get(&self, key: &str) -> Option<&[f32]> {
        self.records.iter().rposition(|r| r.key == key).map(|i| self.vector(i))
    }

    /// 建立键到行号的映射，重复的键以最后一次出现为准
    pub fn key_index(&self) -> HashMap<&str, usize> {
        self.records.iter().enumerate().map(|(i, r)| (r.key.as_str(), i)).collect()
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        Ok(Array2::from_shape_vec((self.len(), self.dim), self.data.clone())?)
    }

    /// 特征库是否存在于磁盘上
    pub fn exists(base: impl AsRef<Path>) -> bool {
        let base = base.as_ref();
        npy_path(base).exists() && json_path(base).exists()
    }

    /// 从 `<base>.npy` 与 `<base>.json` 加载
    pub fn load(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let (npy, json) = (npy_path(base), json_path(base));
        if !npy.exists() {
            return Err(ReidError::not_found("特征矩阵", npy));
        }
        if !json.exists() {
            return Err(ReidError::not_found("特征记录", json));
        }

        let array: Array2<f32> = read_npy(&npy)?;
        let records: Vec<FeatureRecord> = read_json(&json)?;
        if array.nrows() != records.len() {
            return Err(ReidError::InconsistentCatalog {
                what: "特征库行与记录",
                left: array.nrows(),
                right: records.len(),
            });
        }

        let name = base.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let dim = array.ncols();
        let data = array.into_iter().collect();
        debug!("加载特征库 {name}：{} 条，维度 {dim}", records.len());
        Ok(Self { name, dim, records, data })
    }

    /// 加载特征库，文件不存在时返回空库
    pub fn load_or_new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        if Self::exists(base) {
            return Self::load(base);
        }
        let name = base.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(Self::new(name))
    }

    /// 保存到 `<base>.npy` 与 `<base>.json`
    pub fn save(&self, base: impl AsRef<Path>) -> Result<()> {
        let base = base.as_ref();
        let npy = npy_path(base);
        ensure_parent(&npy)?;
        let tmp = tmp_path(&npy);
        write_npy(&tmp, &self.to_array()?)?;
        fs::rename(tmp, &npy)?;
        write_json(json_path(base), &self.records)?;
        Ok(())
    }
}

fn npy_path(base: &Path) -> PathBuf {
    base.with_extension("npy")
}

fn json_path(base: &Path) -> PathBuf {
    base.with_extension("json")
}
