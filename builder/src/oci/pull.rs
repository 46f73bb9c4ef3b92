//! Base image resolution.
//!
//! The build engine asks a [`BaseImageSource`] for the image named in
//! `FROM`. [`ImagePuller`] serves it from the local store and falls back to
//! the registry; [`LocalImageSource`] never leaves the store.

use std::sync::Arc;

use async_trait::async_trait;
use stratum_core::error::{Result, StratumError};

use super::image::OciImage;
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller};
use super::store::{ImageStore, StoredImage};

/// Provides base images by reference.
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    /// Resolve a reference to a loaded image.
    ///
    /// Any failure is reported as `StratumError::Resolution`.
    async fn resolve(&self, reference: &str) -> Result<OciImage>;
}

/// Look up a reference in the store as written, then in normalized form.
async fn lookup(store: &ImageStore, reference: &str) -> Option<StoredImage> {
    if let Some(stored) = store.get(reference).await {
        return Some(stored);
    }
    let parsed = ImageReference::parse(reference).ok()?;
    store.get(&parsed.full_reference()).await
}

fn load(reference: &str, stored: &StoredImage) -> Result<OciImage> {
    OciImage::from_path(&stored.path).map_err(|e| StratumError::resolution(reference, e.to_string()))
}

/// Store-first resolver that pulls missing images from their registry.
pub struct ImagePuller {
    store: Arc<ImageStore>,
    puller: RegistryPuller,
}

impl ImagePuller {
    pub fn new(store: Arc<ImageStore>, auth: RegistryAuth) -> Self {
        Self {
            store,
            puller: RegistryPuller::with_auth(auth),
        }
    }

    /// Pull from the registry and store under the normalized reference.
    async fn pull_and_store(&self, reference: &ImageReference) -> Result<StoredImage> {
        let full_ref = reference.full_reference();

        // Same content under another tag: just add the reference
        let digest = self.puller.manifest_digest(reference).await?;
        if let Some(existing) = self.store.get_by_digest(&digest).await {
            tracing::info!(reference = %full_ref, digest = %digest, "Base image already stored");
            return self.store.put(&full_ref, &digest, &existing.path).await;
        }

        let staging = tempfile::Builder::new()
            .prefix("pull-")
            .tempdir_in(self.store.store_dir())?;
        let digest = self.puller.pull(reference, staging.path()).await?;
        let stored = self.store.put(&full_ref, &digest, staging.path()).await?;

        let evicted = self.store.evict_except(&full_ref).await?;
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), references = ?evicted, "Evicted images from store");
        }
        Ok(stored)
    }
}

#[async_trait]
impl BaseImageSource for ImagePuller {
    async fn resolve(&self, reference: &str) -> Result<OciImage> {
        if let Some(stored) = lookup(&self.store, reference).await {
            tracing::debug!(reference, digest = %stored.digest, "Using stored base image");
            return load(reference, &stored);
        }

        let parsed = ImageReference::parse(reference)
            .map_err(|e| StratumError::resolution(reference, e.to_string()))?;
        let stored = self
            .pull_and_store(&parsed)
            .await
            .map_err(|e| StratumError::resolution(reference, e.to_string()))?;
        load(reference, &stored)
    }
}

/// Resolver restricted to the local store.
pub struct LocalImageSource {
    store: Arc<ImageStore>,
}

impl LocalImageSource {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BaseImageSource for LocalImageSource {
    async fn resolve(&self, reference: &str) -> Result<OciImage> {
        match lookup(&self.store, reference).await {
            Some(stored) => load(reference, &stored),
            None => Err(StratumError::resolution(
                reference,
                "image is not in the local store and registry access is disabled",
            )),
        }
    }
}
