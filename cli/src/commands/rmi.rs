//! `stratum rmi` command - remove one or more stored images.

use clap::Args;
use stratum_core::StratumConfig;

use crate::output;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references or digest prefixes to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that are not found
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, config: &StratumConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;
    let mut errors: Vec<String> = Vec::new();

    for name in &args.images {
        let removed = match store.find(name).await {
            Ok(stored) => store.remove(&stored.reference).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(stored) => {
                println!("Untagged: {}", stored.reference);
                if store.get_by_digest(&stored.digest).await.is_none() {
                    println!("Deleted: {}", output::short_digest(&stored.digest));
                }
            }
            Err(_) if args.force => continue,
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("Failed to remove image(s):\n{}", errors.join("\n")).into())
    }
}
