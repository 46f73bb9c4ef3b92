//! `stratum history` command - Show the steps an image was built from.

use clap::Args;
use stratum_builder::OciImage;
use stratum_core::StratumConfig;

use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    /// Image reference or digest prefix
    pub image: String,

    /// Only show layer diff IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Do not truncate the CREATED BY column
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(
    args: HistoryArgs,
    config: &StratumConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_image_store(config)?;
    let stored = store.find(&args.image).await?;
    let image = OciImage::from_path(&stored.path)?;

    if args.quiet {
        for layer in image.layers() {
            println!("{}", layer.diff_id);
        }
        return Ok(());
    }

    let mut layer_sizes = image
        .layers()
        .iter()
        .map(|l| std::fs::metadata(&l.path).map(|m| m.len()).unwrap_or(0));

    let mut table = output::new_table(&["CREATED", "CREATED BY", "SIZE", "COMMENT"]);
    for entry in image.history() {
        let created = entry
            .created
            .as_deref()
            .map(output::format_rfc3339_ago)
            .unwrap_or_else(|| "<unknown>".to_string());
        let created_by = entry.created_by.as_deref().unwrap_or_default();
        let created_by = if args.no_trunc {
            created_by.to_string()
        } else {
            output::truncate_str(created_by, 60)
        };
        let size = if entry.empty_layer {
            0
        } else {
            layer_sizes.next().unwrap_or(0)
        };
        let comment = entry.comment.clone().unwrap_or_default();

        table.add_row([created, created_by, output::format_bytes(size), comment]);
    }

    println!("{table}");
    Ok(())
}
