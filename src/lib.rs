pub mod catalog;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod fusion;
pub mod index;
pub mod kmeans;
pub mod metrics;
pub mod pipeline;
pub mod recall;
pub mod resolver;
pub mod retrain;
mod server;
pub mod store;
pub mod utils;

pub use config::Opts;
pub use error::{ReidError, Result};
