use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::classifier::CentroidClassifier;
use crate::cli::SubCommandExtend;
use crate::config::ExtractOptions;
use crate::extract::Extractors;
use crate::fusion::fuse;
use crate::resolver::IdentityResolver;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ClassifyCommand {
    #[command(flatten)]
    pub extract: ExtractOptions,
    /// 图片路径
    pub image: PathBuf,
}

impl SubCommandExtend for ClassifyCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let classifier = CentroidClassifier::load(opts.conf_dir.classifier())?;
        let extractors = Extractors::from_options(&self.extract, &opts.conf_dir)?;
        let deep = extractors.deep.extract(&self.image)?;
        let pattern = extractors.pattern.extract(&self.image)?;
        let fused = fuse(&deep, &pattern);

        let resolver = IdentityResolver::new(classifier);
        let resolution = resolver.resolve_image(&opts.conf_dir, &self.image, &deep, &fused)?;
        println!("{}", serde_json::to_string_pretty(&resolution)?);
        Ok(())
    }
}
