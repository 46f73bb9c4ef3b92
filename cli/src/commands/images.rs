//! `stratum images` command.

use clap::Args;
use stratum_builder::{ImageReference, StoredImage};
use stratum_core::StratumConfig;

use crate::output;

const HEADERS: [&str; 5] = ["REPOSITORY", "TAG", "DIGEST", "SIZE", "CREATED"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Format output using placeholders: {{.Repository}}, {{.Tag}}, {{.Digest}},
    /// {{.Size}}, {{.Created}}, {{.Reference}}
    #[arg(long)]
    pub format: Option<String>,
}

pub async fn execute(
    args: ImagesArgs,
    config: &StratumConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let images = if config.images_dir().exists() {
        super::open_image_store(config)?.list().await
    } else {
        Vec::new()
    };

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let rows: Vec<ImageRow> = images.iter().map(ImageRow::from_stored).collect();

    if let Some(ref fmt) = args.format {
        for row in &rows {
            println!("{}", row.apply_format(fmt));
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for row in &rows {
        table.add_row([&row.repository, &row.tag, &row.digest, &row.size, &row.created]);
    }
    println!("{table}");
    Ok(())
}

/// Display fields for a single image row.
struct ImageRow {
    reference: String,
    repository: String,
    tag: String,
    digest: String,
    size: String,
    created: String,
}

impl ImageRow {
    fn from_stored(image: &StoredImage) -> Self {
        let (repository, tag) = split_reference(&image.reference);
        Self {
            reference: image.reference.clone(),
            repository,
            tag,
            digest: output::short_digest(&image.digest),
            size: output::format_bytes(image.size_bytes),
            created: output::format_ago(&image.stored_at),
        }
    }

    /// Apply a format template, replacing `{{.Field}}` placeholders.
    fn apply_format(&self, fmt: &str) -> String {
        fmt.replace("{{.Repository}}", &self.repository)
            .replace("{{.Tag}}", &self.tag)
            .replace("{{.Digest}}", &self.digest)
            .replace("{{.Size}}", &self.size)
            .replace("{{.Created}}", &self.created)
            .replace("{{.Reference}}", &self.reference)
    }
}

/// Repository and tag as the user wrote them, without registry defaults.
fn split_reference(reference: &str) -> (String, String) {
    match ImageReference::parse(reference) {
        Ok(parsed) => {
            let tag = parsed.tag.clone().unwrap_or_else(|| "<none>".to_string());
            let repository = match reference.rsplit_once(':') {
                Some((repo, t)) if t == tag => repo.to_string(),
                _ => reference.split('@').next().unwrap_or(reference).to_string(),
            };
            (repository, tag)
        }
        Err(_) => (reference.to_string(), "<none>".to_string()),
    }
}
