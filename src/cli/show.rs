use anyhow::Result;
use clap::Parser;

use crate::catalog::Catalog;
use crate::classifier::{CentroidClassifier, Classifier};
use crate::cli::SubCommandExtend;
use crate::store::FeatureStore;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let conf_dir = &opts.conf_dir;
        let catalog = Catalog::open(conf_dir)?;
        println!("索引类型\t{:?}", catalog.index_kind());
        println!("向量维度\t{}", catalog.dimension());
        println!("记录数量\t{}", catalog.len());
        for (class, count) in catalog.class_counts() {
            println!("  {class}\t{count}");
        }

        for base in [conf_dir.deep_store(), conf_dir.pattern_store()] {
            if FeatureStore::exists(&base) {
                let store = FeatureStore::load(&base)?;
                println!("{} 特征库\t{} 条，维度 {}", store.name(), store.len(), store.dim());
            }
        }

        if let Ok(classifier) = CentroidClassifier::load(conf_dir.classifier()) {
            println!(
                "分类器\t{} 个类别，输入 {:?}，维度 {:?}",
                classifier.classes().len(),
                classifier.input(),
                classifier.input_width()
            );
        }
        Ok(())
    }
}
