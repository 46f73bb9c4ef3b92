//! Stratum builder - layered container image builds.
//!
//! This crate provides the build engine, the build context and recipe
//! handling, the step layer cache, and OCI image storage and retrieval.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod oci;

// Re-export common types
pub use build::{BuildConfig, BuildResult, ImageBuilder, Recipe, StepExecutor, StepOutcome};
pub use build::{ChrootExecutor, HostExecutor, DEFAULT_TAG};
pub use cache::LayerCache;
pub use oci::{BaseImageSource, ImagePuller, LocalImageSource, OciImage, OciImageConfig};
pub use oci::{ImageReference, ImageStore, RegistryAuth, StoredImage};

/// Stratum builder version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
