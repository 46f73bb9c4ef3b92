//! Build step layer cache.
//!
//! Each step's output layer is stored under its cache key, a SHA256 chain
//! over the parent key, the step descriptor and the step's input digest.
//! Layout: `<cache_dir>/<key>.tar.gz` plus `<key>.meta.json`. Steps that
//! produced no filesystem change are cached as metadata only.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::error::{Result, StratumError};

use crate::build::layer::{sha256_bytes, LayerInfo};

/// Metadata for a cached step layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    /// Cache key (hex)
    pub key: String,
    /// Compressed layer digest (hex), `None` for a step without changes
    pub digest: Option<String>,
    /// Uncompressed layer digest (hex)
    pub diff_id: Option<String>,
    /// Size of the layer blob in bytes
    pub size_bytes: u64,
    /// Instruction that produced the layer
    pub created_by: String,
    /// When this layer was cached
    pub cached_at: DateTime<Utc>,
    /// Last time a build reused this layer
    pub last_accessed: DateTime<Utc>,
}

/// A cache hit.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub key: String,
    /// The cached blob; `None` when the step changed nothing
    pub layer: Option<LayerInfo>,
    pub created_by: String,
}

/// Derive the cache key of a step from its parent key.
///
/// Fields are length-prefixed so distinct inputs can never collide by
/// concatenation.
pub fn chain_key(parent: &str, descriptor: &str, input_digest: &str) -> String {
    let mut material = Vec::new();
    for field in [parent, descriptor, input_digest] {
        material.extend_from_slice(&(field.len() as u64).to_le_bytes());
        material.extend_from_slice(field.as_bytes());
    }
    sha256_bytes(&material)
}

/// File-based cache of build step layers.
pub struct LayerCache {
    /// Root directory for the cache (e.g., ~/.stratum/cache/layers)
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Create a new layer cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            StratumError::Cache(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    /// Cache directory path.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Look up a step by cache key.
    ///
    /// Returns `None` if the key is unknown or the entry is incomplete.
    pub fn get(&self, key: &str) -> Result<Option<CachedLayer>> {
        let meta_path = self.meta_path(key);
        let Some(mut meta) = read_meta(&meta_path) else {
            return Ok(None);
        };

        let layer = match (&meta.digest, &meta.diff_id) {
            (Some(digest), Some(diff_id)) => {
                let blob = self.blob_path(key);
                match std::fs::metadata(&blob) {
                    Ok(m) if m.len() == meta.size_bytes => Some(LayerInfo {
                        path: blob,
                        digest: digest.clone(),
                        diff_id: diff_id.clone(),
                        size: meta.size_bytes,
                    }),
                    _ => {
                        tracing::warn!(key = %key, "Discarding incomplete cache entry");
                        self.invalidate(key)?;
                        return Ok(None);
                    }
                }
            }
            _ => None,
        };

        // Update last_accessed; a failed write only affects eviction order
        meta.last_accessed = Utc::now();
        if let Err(e) = write_meta(&meta_path, &meta) {
            tracing::debug!(key = %key, error = %e, "Failed to update cache access time");
        }

        Ok(Some(CachedLayer {
            key: key.to_string(),
            layer,
            created_by: meta.created_by,
        }))
    }

    /// Store a step layer under its cache key.
    ///
    /// `layer` of `None` records a step that produced no filesystem change.
    pub fn put(
        &self,
        key: &str,
        layer: Option<&LayerInfo>,
        created_by: &str,
    ) -> Result<CachedLayer> {
        let now = Utc::now();
        let blob_path = self.blob_path(key);

        let cached = match layer {
            Some(layer) => {
                // Copy then rename so readers never see a partial blob
                let tmp_path = self.cache_dir.join(format!("{}.tar.gz.tmp", key));
                std::fs::copy(&layer.path, &tmp_path).map_err(|e| {
                    StratumError::Cache(format!(
                        "Failed to copy layer {} into cache: {}",
                        layer.path.display(),
                        e
                    ))
                })?;
                std::fs::rename(&tmp_path, &blob_path).map_err(|e| {
                    StratumError::Cache(format!(
                        "Failed to commit cache entry {}: {}",
                        blob_path.display(),
                        e
                    ))
                })?;
                Some(LayerInfo {
                    path: blob_path,
                    digest: layer.digest.clone(),
                    diff_id: layer.diff_id.clone(),
                    size: layer.size,
                })
            }
            None => {
                if blob_path.exists() {
                    let _ = std::fs::remove_file(&blob_path);
                }
                None
            }
        };

        let meta = CacheMeta {
            key: key.to_string(),
            digest: cached.as_ref().map(|l| l.digest.clone()),
            diff_id: cached.as_ref().map(|l| l.diff_id.clone()),
            size_bytes: cached.as_ref().map_or(0, |l| l.size),
            created_by: created_by.to_string(),
            cached_at: now,
            last_accessed: now,
        };
        write_meta(&self.meta_path(key), &meta)?;

        tracing::debug!(
            key = %key,
            size_bytes = meta.size_bytes,
            created_by = %created_by,
            "Cached build step"
        );

        Ok(CachedLayer {
            key: key.to_string(),
            layer: cached,
            created_by: meta.created_by,
        })
    }

    /// Remove a cached entry by key.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        for path in [self.blob_path(key), self.meta_path(key)] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    StratumError::Cache(format!(
                        "Failed to remove cache file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Prune the cache to stay within the given byte limit.
    ///
    /// Evicts least-recently-accessed entries first.
    /// Returns the number of entries evicted.
    pub fn prune(&self, max_bytes: u64) -> Result<usize> {
        let mut entries = self.list_entries()?;

        let total_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total_size <= max_bytes {
            return Ok(0);
        }

        // Oldest first
        entries.sort_by_key(|e| e.last_accessed);

        let mut current_size = total_size;
        let mut evicted = 0;

        for entry in &entries {
            if current_size <= max_bytes {
                break;
            }
            self.invalidate(&entry.key)?;
            current_size = current_size.saturating_sub(entry.size_bytes);
            evicted += 1;

            tracing::debug!(
                key = %entry.key,
                size_bytes = entry.size_bytes,
                "Evicted cached layer"
            );
        }

        Ok(evicted)
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = self.list_entries()?;
        for entry in &entries {
            self.invalidate(&entry.key)?;
        }
        Ok(entries.len())
    }

    /// List all cache entries with their metadata.
    pub fn list_entries(&self) -> Result<Vec<CacheMeta>> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            StratumError::Cache(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                StratumError::Cache(format!("Failed to read directory entry: {}", e))
            })?;
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".meta.json"));
            if is_meta {
                if let Some(meta) = read_meta(&path) {
                    entries.push(meta);
                }
            }
        }

        Ok(entries)
    }

    /// Get the total size of all cached layers in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.tar.gz", key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json", key))
    }
}

fn read_meta(path: &Path) -> Option<CacheMeta> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_meta(path: &Path, meta: &CacheMeta) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(meta)?).map_err(|e| {
        StratumError::Cache(format!(
            "Failed to write cache metadata {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::layer::create_layer;
    use tempfile::TempDir;

    fn make_layer(dir: &Path, name: &str, content: &str) -> LayerInfo {
        let rootfs = dir.join(format!("{}-rootfs", name));
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(rootfs.join(name), content).unwrap();
        create_layer(
            &rootfs,
            &[PathBuf::from(name)],
            &[],
            &dir.join(format!("{}.tar.gz", name)),
        )
        .unwrap()
    }

    #[test]
    fn test_chain_key_depends_on_every_field() {
        let base = chain_key("parent", "RUN pip install", "abc");
        assert_eq!(base.len(), 64);
        assert_eq!(base, chain_key("parent", "RUN pip install", "abc"));
        assert_ne!(base, chain_key("other", "RUN pip install", "abc"));
        assert_ne!(base, chain_key("parent", "RUN pip install -U", "abc"));
        assert_ne!(base, chain_key("parent", "RUN pip install", "abd"));
        // No ambiguity when shifting bytes between fields
        assert_ne!(chain_key("ab", "c", ""), chain_key("a", "bc", ""));
    }

    #[test]
    fn test_layer_cache_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let cache_dir = tmp.path().join("layers");

        assert!(!cache_dir.exists());
        let _cache = LayerCache::new(&cache_dir).unwrap();
        assert!(cache_dir.is_dir());
    }

    #[test]
    fn test_layer_cache_get_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(tmp.path()).unwrap();
        assert!(cache.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_layer_cache_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "app.py", "print('hi')");

        let key = chain_key("", "COPY app.py .", "digest");
        cache.put(&key, Some(&layer), "COPY app.py .").unwrap();

        let hit = cache.get(&key).unwrap().unwrap();
        let cached = hit.layer.unwrap();
        assert_eq!(cached.digest, layer.digest);
        assert_eq!(cached.diff_id, layer.diff_id);
        assert!(cached.path.starts_with(cache.cache_dir()));
        assert_eq!(hit.created_by, "COPY app.py .");
    }

    #[test]
    fn test_layer_cache_put_empty_step() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(tmp.path()).unwrap();

        cache.put("k", None, "RUN true").unwrap();

        let hit = cache.get("k").unwrap().unwrap();
        assert!(hit.layer.is_none());
        assert_eq!(cache.total_size().unwrap(), 0);
    }

    #[test]
    fn test_layer_cache_truncated_blob_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "data.bin", "binary data");
        let hit = cache.put("k", Some(&layer), "COPY data.bin .").unwrap();

        std::fs::write(hit.layer.unwrap().path, b"trunc").unwrap();

        assert!(cache.get("k").unwrap().is_none());
        assert!(cache.list_entries().unwrap().is_empty());
    }

    #[test]
    fn test_layer_cache_invalidate() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "data.bin", "binary data");
        cache.put("k", Some(&layer), "COPY data.bin .").unwrap();

        assert!(cache.get("k").unwrap().is_some());
        cache.invalidate("k").unwrap();
        assert!(cache.get("k").unwrap().is_none());

        // Nonexistent keys are fine
        cache.invalidate("does_not_exist").unwrap();
    }

    #[test]
    fn test_layer_cache_list_and_total_size() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        assert_eq!(cache.list_entries().unwrap().len(), 0);

        let a = make_layer(tmp.path(), "a.txt", "aaa");
        let b = make_layer(tmp.path(), "b.txt", "bbb");
        cache.put("ka", Some(&a), "COPY a.txt .").unwrap();
        cache.put("kb", Some(&b), "COPY b.txt .").unwrap();

        assert_eq!(cache.list_entries().unwrap().len(), 2);
        assert_eq!(cache.total_size().unwrap(), a.size + b.size);
    }

    #[test]
    fn test_layer_cache_prune_lru() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();

        let old = make_layer(tmp.path(), "old.txt", "old contents");
        let new = make_layer(tmp.path(), "new.txt", "new contents");
        cache.put("old", Some(&old), "COPY old.txt .").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.put("new", Some(&new), "COPY new.txt .").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.get("new").unwrap();

        let evicted = cache.prune(new.size).unwrap();
        assert_eq!(evicted, 1);
        assert!(cache.get("old").unwrap().is_none());
        assert!(cache.get("new").unwrap().is_some());
    }

    #[test]
    fn test_layer_cache_prune_under_limit() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "a.txt", "a");
        cache.put("k", Some(&layer), "COPY a.txt .").unwrap();
        assert_eq!(cache.prune(u64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_layer_cache_clear() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "a.txt", "a");
        cache.put("k1", Some(&layer), "COPY a.txt .").unwrap();
        cache.put("k2", None, "RUN true").unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.list_entries().unwrap().is_empty());
    }
}
