//! Image building from Dockerfile-syntax recipes.
//!
//! Steps run in recipe order. Each produced layer is cached under a key
//! chained from the previous step, so placing the dependency manifest copy
//! and install before the source copy lets source edits reuse the install.

mod assemble;
pub mod context;
pub mod engine;
pub mod executor;
pub mod layer;
pub mod recipe;

pub use context::{BuildContext, ContextEntry, IGNORE_FILE};
pub use engine::{BuildConfig, BuildResult, ImageBuilder, StepOutcome, StepReport, DEFAULT_TAG};
pub use executor::{ChrootExecutor, HostExecutor, RunOutput, RunRequest, StepExecutor};
pub use layer::{create_layer, sha256_bytes, sha256_file, DirSnapshot, LayerInfo};
pub use recipe::{Instruction, Recipe};
