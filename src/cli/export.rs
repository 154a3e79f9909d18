use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use ndarray::Array2;
use ndarray_npy::write_npy;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::cli::SubCommandExtend;
use crate::utils::write_json;
use crate::Opts;

#[derive(Parser, Debug, Clone)]
pub struct ExportCommand {
    /// 导出的向量文件，同名的 .json 文件保存类别与路径
    #[arg(short, long, default_value = "catalog.npy")]
    pub output: PathBuf,
}

#[derive(Serialize)]
struct ExportRecord<'a> {
    class: &'a str,
    image_path: &'a str,
}

impl SubCommandExtend for ExportCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let catalog = Catalog::open(&opts.conf_dir)?;
        let snapshot = catalog.load_all()?;
        let data = Array2::from_shape_vec(
            (snapshot.vectors.len(), catalog.dimension()),
            snapshot.vectors.concat(),
        )?;
        write_npy(&self.output, &data)?;

        let records = snapshot
            .labels
            .iter()
            .zip(&snapshot.paths)
            .map(|(class, image_path)| ExportRecord { class, image_path })
            .collect::<Vec<_>>();
        write_json(self.output.with_extension("json"), &records)?;
        info!("导出 {} 条向量到 {}", records.len(), self.output.display());
        Ok(())
    }
}
