use std::path::Path;

use crate::error::{ReidError, Result};
use crate::extract::FeatureExtractor;
use crate::store::FeatureStore;
use crate::utils::stem_key;

/// 从已保存的特征库中按文件名查找特征
pub struct PrecomputedExtractor {
    name: String,
    store: FeatureStore,
}

impl PrecomputedExtractor {
    pub fn new(name: impl Into<String>, store: FeatureStore) -> Self {
        Self { name: name.into(), store }
    }

    pub fn open(name: impl Into<String>, base: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(name, FeatureStore::load(base)?))
    }
}

impl FeatureExtractor for PrecomputedExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<f32>> {
        let key = stem_key(path);
        self.store
            .get(&key)
            .map(|v| v.to_vec())
            .ok_or_else(|| ReidError::extraction(path, format!("{} 特征库中没有 {key}", self.name)))
    }

    fn dim(&self) -> Option<usize> {
        Some(self.store.dim())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
