//! Local image store.
//!
//! Images are kept as OCI layouts under `<store>/sha256/<manifest hex>/`.
//! A persistent `index.json` maps references (tags) to digests; several
//! tags may share one layout. Least-recently-used images are evicted when
//! the store grows past its size limit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::error::{Result, StratumError};
use tokio::sync::RwLock;

/// A tagged image in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Reference the image is stored under (e.g. "myapp:latest")
    pub reference: String,
    /// Manifest digest ("sha256:...")
    pub digest: String,
    /// Size of the image layout on disk
    pub size_bytes: u64,
    /// When the reference was stored
    pub stored_at: DateTime<Utc>,
    /// Last time the image was read
    pub last_used: DateTime<Utc>,
    /// OCI layout directory
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-backed image store with an in-memory index.
pub struct ImageStore {
    store_dir: PathBuf,
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
    max_size_bytes: u64,
}

impl ImageStore {
    /// Open (or create) a store and load its index.
    pub fn new(store_dir: &Path, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(store_dir.join("sha256")).map_err(|e| {
            StratumError::OciImage(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
            max_size_bytes,
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Look up an image by reference and mark it used.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        let updated = {
            let mut index = self.index.write().await;
            let image = index.get_mut(reference)?;
            image.last_used = Utc::now();
            image.clone()
        };
        self.save_best_effort().await;
        Some(updated)
    }

    /// Look up an image by manifest digest and mark it used.
    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        let updated = {
            let mut index = self.index.write().await;
            let image = index.values_mut().find(|img| img.digest == digest)?;
            image.last_used = Utc::now();
            image.clone()
        };
        self.save_best_effort().await;
        Some(updated)
    }

    /// Find an image by reference, full digest or unambiguous digest prefix.
    pub async fn find(&self, name: &str) -> Result<StoredImage> {
        if let Some(image) = self.get(name).await {
            return Ok(image);
        }

        let hex = name.strip_prefix("sha256:").unwrap_or(name);
        if hex.len() < 4 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(not_found(name));
        }

        let mut matches: Vec<StoredImage> = {
            let index = self.index.read().await;
            index
                .values()
                .filter(|img| {
                    img.digest
                        .strip_prefix("sha256:")
                        .unwrap_or(img.digest.as_str())
                        .starts_with(hex)
                })
                .cloned()
                .collect()
        };
        matches.sort_by(|a, b| a.digest.cmp(&b.digest));
        matches.dedup_by(|a, b| a.digest == b.digest);

        match matches.len() {
            0 => Err(not_found(name)),
            1 => Ok(matches.remove(0)),
            _ => Err(StratumError::OciImage(format!(
                "Ambiguous image digest prefix: {}",
                name
            ))),
        }
    }

    /// Store an OCI layout under `reference`.
    ///
    /// The layout is copied into the store unless one with the same digest
    /// is already present. If `reference` previously pointed at another
    /// digest that no other reference uses, that layout is deleted.
    pub async fn put(&self, reference: &str, digest: &str, source_dir: &Path) -> Result<StoredImage> {
        let target_dir = self.layout_dir(digest);

        if !target_dir.exists() {
            let staging = target_dir.with_extension("tmp");
            if staging.exists() {
                let _ = std::fs::remove_dir_all(&staging);
            }
            copy_dir_recursive(source_dir, &staging)
                .and_then(|_| std::fs::rename(&staging, &target_dir))
                .map_err(|e| {
                    let _ = std::fs::remove_dir_all(&staging);
                    StratumError::OciImage(format!("Failed to copy image into store: {}", e))
                })?;
        }

        let now = Utc::now();
        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: dir_size(&target_dir),
            stored_at: now,
            last_used: now,
            path: target_dir,
        };

        let orphaned = {
            let mut index = self.index.write().await;
            let previous = index.insert(reference.to_string(), stored.clone());
            previous
                .filter(|old| old.digest != digest)
                .filter(|old| !index.values().any(|img| img.digest == old.digest))
        };
        if let Some(old) = orphaned {
            tracing::debug!(reference, digest = %old.digest, "Removing untagged image");
            remove_layout(&old.path)?;
        }

        self.save_index().await?;
        Ok(stored)
    }

    /// Remove a reference. The layout is deleted once no reference uses it.
    pub async fn remove(&self, reference: &str) -> Result<StoredImage> {
        let (image, still_used) = {
            let mut index = self.index.write().await;
            let image = index.remove(reference).ok_or_else(|| not_found(reference))?;
            let still_used = index.values().any(|img| img.digest == image.digest);
            (image, still_used)
        };

        if !still_used {
            remove_layout(&image.path)?;
        }

        self.save_index().await?;
        Ok(image)
    }

    /// All stored references, sorted by reference.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        images
    }

    /// Evict least-recently-used images until the store fits its limit.
    ///
    /// Returns the evicted references.
    pub async fn evict(&self) -> Result<Vec<String>> {
        self.evict_lru(None).await
    }

    /// Like [`evict`](Self::evict), but never evicts `keep` or another
    /// reference to its layout. The store may stay over its limit.
    pub async fn evict_except(&self, keep: &str) -> Result<Vec<String>> {
        self.evict_lru(Some(keep)).await
    }

    async fn evict_lru(&self, keep: Option<&str>) -> Result<Vec<String>> {
        let mut evicted = Vec::new();

        while self.total_size().await > self.max_size_bytes {
            let lru = {
                let index = self.index.read().await;
                let kept_digest = keep.and_then(|r| index.get(r)).map(|img| img.digest.clone());
                index
                    .values()
                    .filter(|img| Some(img.reference.as_str()) != keep)
                    .filter(|img| Some(&img.digest) != kept_digest.as_ref())
                    .min_by_key(|img| img.last_used)
                    .map(|img| img.reference.clone())
            };
            let Some(reference) = lru else {
                break;
            };
            self.remove(&reference).await?;
            tracing::info!(reference = %reference, "Evicted image from store");
            evicted.push(reference);
        }

        Ok(evicted)
    }

    /// Size of all layouts on disk, counting shared layouts once.
    pub async fn total_size(&self) -> u64 {
        let index = self.index.read().await;
        let mut by_digest: HashMap<&str, u64> = HashMap::new();
        for img in index.values() {
            by_digest.insert(img.digest.as_str(), img.size_bytes);
        }
        by_digest.values().sum()
    }

    fn layout_dir(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.store_dir.join("sha256").join(hex)
    }

    async fn save_index(&self) -> Result<()> {
        let store_index = {
            let index = self.index.read().await;
            let mut images: Vec<StoredImage> = index.values().cloned().collect();
            images.sort_by(|a, b| a.reference.cmp(&b.reference));
            StoreIndex { images }
        };

        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");
        let tmp_path = self.store_dir.join("index.json.tmp");

        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            StratumError::OciImage(format!(
                "Failed to write image store index {}: {}",
                index_path.display(),
                e
            ))
        })
    }

    async fn save_best_effort(&self) {
        if let Err(e) = self.save_index().await {
            tracing::debug!(error = %e, "Failed to persist image store index");
        }
    }
}

fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
    let index_path = store_dir.join("index.json");
    if !index_path.exists() {
        return Ok(HashMap::new());
    }

    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        StratumError::OciImage(format!(
            "Failed to read image store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
        StratumError::OciImage(format!("Failed to parse image store index: {}", e))
    })?;

    // Drop entries whose layout vanished
    Ok(store_index
        .images
        .into_iter()
        .filter(|img| img.path.exists())
        .map(|img| (img.reference.clone(), img))
        .collect())
}

fn not_found(name: &str) -> StratumError {
    StratumError::OciImage(format!("Image not found: {}", name))
}

fn remove_layout(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| {
            StratumError::OciImage(format!(
                "Failed to remove image directory {}: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
