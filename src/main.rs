use clap::Parser;

use wildreid::cli::SubCommandExtend;
use wildreid::config::{Opts, SubCommand};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Build(config) => config.run(&opts).await,
        SubCommand::Identify(config) => config.run(&opts).await,
        SubCommand::Reid(config) => config.run(&opts).await,
        SubCommand::Classify(config) => config.run(&opts).await,
        SubCommand::Server(config) => config.run(&opts).await,
        SubCommand::Export(config) => config.run(&opts).await,
        SubCommand::Show(config) => config.run(&opts).await,
    }
}
