//! 根据召回率决定是否完整地重新训练

use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics;
use crate::pipeline::BuildReport;
use crate::recall::{RecallOutcome, RecallSource};
use crate::utils::{read_json, write_json};

/// 完整的重新训练流程：检测、提取特征、重建目录、训练分类器
pub trait Rebuilder {
    fn rebuild(&mut self) -> anyhow::Result<BuildReport>;
}

/// 运行日志中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallRunRecord {
    pub image: String,
    pub recall: f32,
    pub triggered_retrain: bool,
}

#[derive(Debug, Serialize)]
pub struct RetrainOutcome {
    /// 检索失败时为 None
    pub recall_outcome: Option<RecallOutcome>,
    pub recall: f32,
    pub triggered_retrain: bool,
    pub report: Option<BuildReport>,
}

/// 向 JSON 数组形式的运行日志追加一条记录
pub fn append_run_log(path: impl AsRef<Path>, record: RecallRunRecord) -> Result<()> {
    let path = path.as_ref();
    let mut records: Vec<RecallRunRecord> =
        if path.exists() { read_json(path)? } else { vec![] };
    records.push(record);
    write_json(path, &records)
}

pub struct RetrainController<S, B> {
    source: S,
    rebuilder: B,
    threshold: f32,
    run_log: PathBuf,
}

impl<S: RecallSource, B: Rebuilder> RetrainController<S, B> {
    pub fn new(source: S, rebuilder: B, threshold: f32, run_log: impl Into<PathBuf>) -> Self {
        Self { source, rebuilder, threshold, run_log: run_log.into() }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn rebuilder(&self) -> &B {
        &self.rebuilder
    }

    /// 检索一张图片，召回率低于阈值时同步地重新训练
    ///
    /// 检索失败按召回率 0 处理。无论是否重新训练都会先写入运行日志，重新训练失败时不会重试。
    pub fn run(&mut self, image: &Path) -> anyhow::Result<RetrainOutcome> {
        let recall_outcome = match self.source.identify(image) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("检索 {} 失败，召回率按 0 处理：{e}", image.display());
                None
            }
        };
        let recall = recall_outcome.as_ref().map(|o| o.recall()).unwrap_or(0.0);
        let triggered_retrain = recall < self.threshold;

        append_run_log(
            &self.run_log,
            RecallRunRecord {
                image: image.to_string_lossy().into_owned(),
                recall,
                triggered_retrain,
            },
        )?;

        if !triggered_retrain {
            info!("召回率 {recall:.3} 不低于阈值 {:.3}，无需重新训练", self.threshold);
            return Ok(RetrainOutcome { recall_outcome, recall, triggered_retrain, report: None });
        }

        info!("召回率 {recall:.3} 低于阈值 {:.3}，开始重新训练", self.threshold);
        metrics::RETRAIN_COUNT.inc();
        let report = self.rebuilder.rebuild().inspect_err(|e| error!("重新训练失败：{e:#}"))?;
        self.source.reload()?;
        Ok(RetrainOutcome { recall_outcome, recall, triggered_retrain, report: Some(report) })
    }
}
