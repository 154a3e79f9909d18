use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, IndexOptions, PipelineOptions, RecallOptions, Settings};
use crate::extract::Extractors;
use crate::pipeline::TrainingPipeline;
use crate::retrain::Rebuilder;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let settings = Settings {
            conf_dir: opts.conf_dir.clone(),
            index: self.index.clone(),
            recall: RecallOptions::default(),
        };
        let extractors = Extractors::from_options(&self.extract, &opts.conf_dir)?;
        let mut pipeline = TrainingPipeline::new(settings, self.pipeline.clone(), extractors);
        let report = pipeline.rebuild()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        info!("构建完成");
        Ok(())
    }
}
