//! CLI command definitions and dispatch.

mod build;
mod cache;
mod history;
mod images;
mod rmi;

use clap::{Parser, Subcommand};
use stratum_builder::{ImageStore, LayerCache};
use stratum_core::StratumConfig;

/// Stratum - layered container image builder.
#[derive(Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a recipe
    Build(build::BuildArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Remove one or more stored images
    Rmi(rmi::RmiArgs),
    /// Show the build history of an image
    History(history::HistoryArgs),
    /// Inspect or prune the layer cache
    Cache(cache::CacheArgs),
}

/// Open the image store under the configured home.
pub(crate) fn open_image_store(
    config: &StratumConfig,
) -> Result<ImageStore, Box<dyn std::error::Error>> {
    Ok(ImageStore::new(&config.images_dir(), config.store_max_bytes)?)
}

/// Open the step layer cache under the configured home.
pub(crate) fn open_layer_cache(
    config: &StratumConfig,
) -> Result<LayerCache, Box<dyn std::error::Error>> {
    Ok(LayerCache::new(&config.cache_dir())?)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: StratumConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, &config).await,
        Command::Images(args) => images::execute(args, &config).await,
        Command::Rmi(args) => rmi::execute(args, &config).await,
        Command::History(args) => history::execute(args, &config).await,
        Command::Cache(args) => cache::execute(args, &config).await,
    }
}
