//! `stratum cache` command - inspect and prune the step layer cache.

use clap::{Args, Subcommand};
use stratum_core::config::parse_size;
use stratum_core::StratumConfig;

use crate::output;

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cached step layers
    Ls,
    /// Remove least recently used entries
    Prune(PruneArgs),
}

#[derive(Args)]
pub struct PruneArgs {
    /// Shrink the cache to this size (e.g. "1g"; default from config)
    #[arg(long, conflicts_with = "all")]
    pub max_size: Option<String>,

    /// Remove every entry
    #[arg(long)]
    pub all: bool,
}

pub async fn execute(args: CacheArgs, config: &StratumConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache = super::open_layer_cache(config)?;

    match args.command {
        CacheCommand::Ls => {
            let mut entries = cache.list_entries()?;
            entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

            let mut table = output::new_table(&["KEY", "CREATED BY", "SIZE", "LAST USED"]);
            for entry in &entries {
                table.add_row([
                    entry.key.chars().take(12).collect::<String>(),
                    output::truncate_str(&entry.created_by, 50),
                    output::format_bytes(entry.size_bytes),
                    output::format_ago(&entry.last_accessed),
                ]);
            }
            println!("{table}");
            println!(
                "\n{} entries, {} total",
                entries.len(),
                output::format_bytes(cache.total_size()?)
            );
        }
        CacheCommand::Prune(prune) => {
            let removed = if prune.all {
                cache.clear()?
            } else {
                let max_bytes = match prune.max_size {
                    Some(ref size) => parse_size(size)?,
                    None => config.cache_max_bytes,
                };
                cache.prune(max_bytes)?
            };
            println!(
                "Removed {} cache entries ({} remaining)",
                removed,
                output::format_bytes(cache.total_size()?)
            );
        }
    }

    Ok(())
}
