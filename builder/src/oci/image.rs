//! OCI image layout reading.
//!
//! An image directory holds `oci-layout`, `index.json` and content
//! addressed blobs under `blobs/sha256/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};
use stratum_core::error::{Result, StratumError};

/// An OCI image loaded from disk.
#[derive(Debug)]
pub struct OciImage {
    root_dir: PathBuf,
    manifest_digest: String,
    config: OciImageConfig,
    layers: Vec<ImageLayer>,
    history: Vec<HistoryEntry>,
}

/// One filesystem layer of an image, bottom to top.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    /// Blob path inside the image layout
    pub path: PathBuf,
    /// Compressed digest ("sha256:...")
    pub digest: String,
    /// Uncompressed digest ("sha256:...")
    pub diff_id: String,
    /// Media type as listed in the manifest
    pub media_type: String,
}

/// Runtime configuration carried by an image.
#[derive(Debug, Clone, Default)]
pub struct OciImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub exposed_ports: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Platform the image was built for
    pub os: String,
    pub architecture: String,
}

/// An entry of the config `history` array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// The parts of the config blob the OCI image types do not expose uniformly.
#[derive(Deserialize)]
struct RawConfig {
    rootfs: RawRootfs,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct RawRootfs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

impl OciImage {
    /// Load an image from an OCI layout directory.
    ///
    /// Uses the first manifest of `index.json`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        validate_oci_layout(&root_dir)?;

        let index: ImageIndex = read_json(&root_dir.join("index.json"), "index.json")?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| StratumError::OciImage("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            read_json(&blob_path(&root_dir, &manifest_digest), "manifest")?;

        let config_path = blob_path(&root_dir, manifest.config().digest());
        let oci_config: ImageConfiguration = read_json(&config_path, "config")?;
        let raw: RawConfig = read_json(&config_path, "config")?;

        if raw.rootfs.diff_ids.len() != manifest.layers().len() {
            return Err(StratumError::OciImage(format!(
                "Image {} lists {} layers but {} diff_ids",
                root_dir.display(),
                manifest.layers().len(),
                raw.rootfs.diff_ids.len()
            )));
        }

        let layers = manifest
            .layers()
            .iter()
            .zip(raw.rootfs.diff_ids)
            .map(|(descriptor, diff_id)| ImageLayer {
                path: blob_path(&root_dir, descriptor.digest()),
                digest: descriptor.digest().to_string(),
                diff_id,
                media_type: descriptor.media_type().to_string(),
            })
            .collect();

        Ok(Self {
            root_dir,
            manifest_digest,
            config: OciImageConfig::from_oci_config(&oci_config),
            layers,
            history: raw.history,
        })
    }

    /// Digest of the image manifest ("sha256:...").
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    /// Filesystem layers, bottom to top.
    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.config.env
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.config.working_dir.as_deref()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(|s| s.as_str())
    }
}

impl OciImageConfig {
    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let config = oci_config.config().as_ref();

        let env = config
            .and_then(|c| c.env().as_ref())
            .map(|list| {
                list.iter()
                    .filter_map(|e| e.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let exposed_ports = config
            .and_then(|c| c.exposed_ports().as_ref())
            .map(|ports| ports.to_vec())
            .unwrap_or_default();

        Self {
            entrypoint: config.and_then(|c| c.entrypoint().clone()),
            cmd: config.and_then(|c| c.cmd().clone()),
            env,
            working_dir: config
                .and_then(|c| c.working_dir().clone())
                .filter(|w| !w.is_empty()),
            user: config.and_then(|c| c.user().clone()).filter(|u| !u.is_empty()),
            exposed_ports,
            labels: config.and_then(|c| c.labels().clone()).unwrap_or_default(),
            os: oci_config.os().to_string(),
            architecture: oci_config.architecture().to_string(),
        }
    }
}

/// Path of a blob inside an image layout. Bare hex is taken as sha256.
pub fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}

fn validate_oci_layout(root_dir: &Path) -> Result<()> {
    for required in ["oci-layout", "index.json", "blobs"] {
        if !root_dir.join(required).exists() {
            return Err(StratumError::OciImage(format!(
                "Not a valid OCI layout: missing {} in {}",
                required,
                root_dir.display()
            )));
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        StratumError::OciImage(format!(
            "Failed to read {} at {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| StratumError::OciImage(format!("Failed to parse {}: {}", what, e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::build::layer::{create_layer, sha256_bytes};
    use std::fs;
    use tempfile::TempDir;

    /// Write a one-layer image containing `hello.txt` and return its
    /// manifest digest.
    pub(crate) fn write_test_image(dir: &Path) -> String {
        let blobs = dir.join("blobs/sha256");
        fs::create_dir_all(&blobs).unwrap();
        fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

        let staging = TempDir::new().unwrap();
        let rootfs = staging.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("hello.txt"), "hello").unwrap();
        let layer = create_layer(
            &rootfs,
            &[PathBuf::from("hello.txt")],
            &[],
            &staging.path().join("layer.tar.gz"),
        )
        .unwrap();
        fs::copy(&layer.path, blobs.join(&layer.digest)).unwrap();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin:/bin", "LANG=C.UTF-8"],
                "WorkingDir": "/srv",
                "Cmd": ["python3"],
                "Labels": {"maintainer": "ops"}
            },
            "rootfs": {"type": "layers", "diff_ids": [layer.prefixed_diff_id()]},
            "history": [{"created_by": "ADD rootfs.tar /"}]
        })
        .to_string();
        let config_hex = sha256_bytes(config.as_bytes());
        fs::write(blobs.join(&config_hex), &config).unwrap();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": format!("sha256:{}", config_hex),
                "size": config.len()
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer.prefixed_digest(),
                "size": layer.size
            }]
        })
        .to_string();
        let manifest_hex = sha256_bytes(manifest.as_bytes());
        fs::write(blobs.join(&manifest_hex), &manifest).unwrap();

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": format!("sha256:{}", manifest_hex),
                "size": manifest.len()
            }]
        });
        fs::write(dir.join("index.json"), index.to_string()).unwrap();

        format!("sha256:{}", manifest_hex)
    }

    #[test]
    fn test_validate_missing_files() {
        let tmp = TempDir::new().unwrap();
        let err = validate_oci_layout(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));

        fs::write(tmp.path().join("oci-layout"), "{}").unwrap();
        let err = validate_oci_layout(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("index.json"));

        fs::write(tmp.path().join("index.json"), "{}").unwrap();
        let err = validate_oci_layout(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("blobs"));
    }

    #[test]
    fn test_blob_path() {
        let root = PathBuf::from("/images/x");
        assert_eq!(
            blob_path(&root, "sha256:abc"),
            PathBuf::from("/images/x/blobs/sha256/abc")
        );
        assert_eq!(
            blob_path(&root, "abc"),
            PathBuf::from("/images/x/blobs/sha256/abc")
        );
    }

    #[test]
    fn test_from_path() {
        let tmp = TempDir::new().unwrap();
        let digest = write_test_image(tmp.path());

        let image = OciImage::from_path(tmp.path()).unwrap();
        assert_eq!(image.manifest_digest(), digest);
        assert_eq!(image.working_dir(), Some("/srv"));
        assert_eq!(image.config().cmd, Some(vec!["python3".to_string()]));
        assert!(image.env().iter().any(|(k, v)| k == "LANG" && v == "C.UTF-8"));
        assert_eq!(image.label("maintainer"), Some("ops"));
        assert_eq!(image.config().os, "linux");
        assert_eq!(image.config().architecture, "amd64");

        assert_eq!(image.layers().len(), 1);
        assert!(image.layers()[0].path.is_file());
        assert!(image.layers()[0].diff_id.starts_with("sha256:"));
        assert_eq!(
            image.layers()[0].media_type,
            "application/vnd.oci.image.layer.v1.tar+gzip"
        );
        assert_eq!(
            image.history()[0].created_by.as_deref(),
            Some("ADD rootfs.tar /")
        );
    }

    #[test]
    fn test_from_path_nonexistent() {
        assert!(OciImage::from_path("/nonexistent/image").is_err());
    }

    #[test]
    fn test_history_entry_serialization_skips_defaults() {
        let entry = HistoryEntry {
            created_by: Some("WORKDIR /workspace".to_string()),
            empty_layer: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"created_by": "WORKDIR /workspace", "empty_layer": true})
        );

        let plain = serde_json::to_value(HistoryEntry::default()).unwrap();
        assert_eq!(plain, serde_json::json!({}));
    }
}
