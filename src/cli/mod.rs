mod build;
mod classify;
mod export;
mod identify;
mod reid;
pub mod server;
mod show;

pub use build::*;
pub use classify::*;
pub use export::*;
pub use identify::*;
pub use reid::*;
pub use server::*;
pub use show::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
