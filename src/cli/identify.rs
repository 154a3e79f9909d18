use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{ExtractOptions, IndexOptions, RecallOptions, Settings};
use crate::extract::Extractors;
use crate::recall::{RecallEngine, RecallSource};
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct IdentifyCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    #[command(flatten)]
    pub recall: RecallOptions,
    /// 被检索的图片路径
    pub image: PathBuf,
}

impl SubCommandExtend for IdentifyCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let settings = Settings {
            conf_dir: opts.conf_dir.clone(),
            index: IndexOptions::default(),
            recall: self.recall.clone(),
        };
        let extractors = Extractors::from_options(&self.extract, &opts.conf_dir)?;
        let mut engine = RecallEngine::open(settings, extractors)?;
        let outcome = engine.identify(&self.image)?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        Ok(())
    }
}
