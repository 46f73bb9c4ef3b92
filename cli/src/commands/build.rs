//! `stratum build` command - Build an image from a recipe.
//!
//! The recipe is read from a Dockerfile in the context, or generated from
//! `--manifest/--base/--install` as the canonical layered recipe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use stratum_builder::{
    BaseImageSource, BuildConfig, ChrootExecutor, HostExecutor, ImageBuilder, ImagePuller,
    LocalImageSource, Recipe, RegistryAuth, StepExecutor,
};
use stratum_core::{events, BuildEvent, EventEmitter, ExecutorKind, StratumConfig};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::output;

/// Recipe file read from the context when `-f` is not given.
const DEFAULT_RECIPE: &str = "Dockerfile";

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "myapp:1.0")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to the recipe (default: <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file", conflicts_with = "manifest")]
    pub file: Option<String>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Do not use cached step layers
    #[arg(long)]
    pub no_cache: bool,

    /// Suppress build output and print only the image digest
    #[arg(short, long)]
    pub quiet: bool,

    /// Dependency manifest to copy and install before the source tree
    #[arg(long, requires_all = ["base", "install"])]
    pub manifest: Option<String>,

    /// Base image for the layered recipe
    #[arg(long, requires = "manifest")]
    pub base: Option<String>,

    /// Install command for the layered recipe
    #[arg(long, requires = "manifest")]
    pub install: Option<String>,

    /// Working directory for the layered recipe
    #[arg(long, default_value = "/workspace")]
    pub workdir: String,

    /// How RUN steps are executed (chroot, host)
    #[arg(long)]
    pub executor: Option<ExecutorKind>,

    /// Only use base images already in the local store
    #[arg(long)]
    pub offline: bool,
}

pub async fn execute(
    args: BuildArgs,
    config: &StratumConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;
    if !context_dir.is_dir() {
        return Err(format!("Build context '{}' is not a directory", context_dir.display()).into());
    }

    let recipe = load_recipe(&args, &context_dir)?;
    let build_args = parse_build_args(&args.build_arg)?;

    let store = Arc::new(super::open_image_store(config)?);
    let cache = Arc::new(super::open_layer_cache(config)?);

    let source: Arc<dyn BaseImageSource> = if args.offline || config.offline {
        Arc::new(LocalImageSource::new(store.clone()))
    } else {
        Arc::new(ImagePuller::new(store.clone(), RegistryAuth::from_env()))
    };
    let executor: Arc<dyn StepExecutor> = match args.executor.unwrap_or(config.executor) {
        ExecutorKind::Chroot => Arc::new(ChrootExecutor::new()),
        ExecutorKind::Host => Arc::new(HostExecutor::new()),
    };

    let emitter = EventEmitter::default();
    let progress = (!args.quiet).then(|| tokio::spawn(print_progress(emitter.subscribe())));
    let builder = ImageBuilder::new(store, cache.clone(), source, executor).with_events(emitter);

    let mut build_config = BuildConfig::new(context_dir, recipe);
    build_config.tag = args.tag.clone();
    build_config.build_args = build_args;
    build_config.no_cache = args.no_cache;

    let result = builder.build(build_config).await;
    // Closes the event channel so the progress printer finishes
    drop(builder);
    if let Some(handle) = progress {
        let _ = handle.await;
    }
    let result = result?;

    let pruned = cache.prune(config.cache_max_bytes)?;
    if pruned > 0 {
        tracing::info!(removed = pruned, "Pruned layer cache");
    }

    if args.quiet {
        println!("{}", result.digest);
    } else {
        println!("Successfully built {}", output::short_digest(&result.digest));
        println!("Successfully tagged {}", result.reference);
    }

    Ok(())
}

/// Recipe from the layered-recipe flags, or the recipe file.
fn load_recipe(args: &BuildArgs, context_dir: &Path) -> Result<Recipe, Box<dyn std::error::Error>> {
    if let (Some(manifest), Some(base), Some(install)) = (&args.manifest, &args.base, &args.install) {
        return Ok(Recipe::layered(base, &args.workdir, manifest, install));
    }

    let path = match &args.file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => context_dir.join(DEFAULT_RECIPE),
    };
    if !path.exists() {
        return Err(format!("Recipe not found at {}", path.display()).into());
    }
    Ok(Recipe::from_file(&path)?)
}

/// Parse KEY=VALUE pairs into a HashMap.
fn parse_build_args(args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid build arg (expected KEY=VALUE): {arg}"))?;
        if key.is_empty() {
            return Err(format!("Invalid build arg (empty name): {arg}"));
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Print step progress until the build finishes.
async fn print_progress(mut rx: broadcast::Receiver<BuildEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        let payload = &event.payload;
        match event.key.as_str() {
            events::STEP_STARTED => {
                let index = payload.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let total = payload.get("total").and_then(|v| v.as_u64()).unwrap_or(0);
                let instruction = payload.get_str("instruction").unwrap_or_default();
                println!("Step {index}/{total} : {instruction}");
            }
            events::STEP_CACHED => println!(" ---> Using cache"),
            events::STEP_COMPLETED => {
                if payload.get_str("outcome") == Some("executed") {
                    println!(" ---> Done");
                }
            }
            events::BUILD_COMPLETED | events::BUILD_FAILED => break,
            _ => {}
        }
    }
}
