use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, IndexOptions, PipelineOptions, RecallOptions, Settings};
use crate::extract::Extractors;
use crate::pipeline::TrainingPipeline;
use crate::recall::LazyRecallEngine;
use crate::retrain::RetrainController;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ReidCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub recall: RecallOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    /// 被检索的图片路径
    pub image: PathBuf,
}

impl SubCommandExtend for ReidCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let settings = Settings {
            conf_dir: opts.conf_dir.clone(),
            index: self.index.clone(),
            recall: self.recall.clone(),
        };

        // 召回引擎与重建流程各自持有一组提取器，目录不存在时由重建流程创建
        let engine = LazyRecallEngine::new(
            settings.clone(),
            Extractors::from_options(&self.extract, &opts.conf_dir)?,
        );
        let pipeline = TrainingPipeline::new(
            settings.clone(),
            self.pipeline.clone(),
            Extractors::from_options(&self.extract, &opts.conf_dir)?,
        );

        let mut controller = RetrainController::new(
            engine,
            pipeline,
            self.recall.recall_threshold,
            opts.conf_dir.run_log(),
        );
        let outcome = controller.run(&self.image)?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        Ok(())
    }
}
