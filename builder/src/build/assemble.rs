//! Final image assembly.
//!
//! Writes the config, manifest, index.json and oci-layout for a finished
//! build and hands the layout to the image store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use stratum_core::error::{Result, StratumError};

use super::layer::{sha256_bytes, LayerInfo};
use crate::oci::{HistoryEntry, ImageLayer, ImageStore, StoredImage};

const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// A layer of the image being assembled.
#[derive(Debug, Clone)]
pub(crate) struct OutputLayer {
    pub path: PathBuf,
    /// "sha256:..." of the blob
    pub digest: String,
    /// "sha256:..." of the uncompressed tar
    pub diff_id: String,
    pub size: u64,
    pub media_type: &'static str,
}

impl OutputLayer {
    pub(crate) fn from_base(layer: &ImageLayer) -> Result<Self> {
        let size = std::fs::metadata(&layer.path)
            .map_err(|e| {
                StratumError::OciImage(format!(
                    "Base layer {} is unreadable: {}",
                    layer.digest, e
                ))
            })?
            .len();
        let media_type = if layer.media_type.ends_with("gzip") {
            MEDIA_TYPE_LAYER_GZIP
        } else {
            MEDIA_TYPE_LAYER_TAR
        };
        Ok(Self {
            path: layer.path.clone(),
            digest: layer.digest.clone(),
            diff_id: layer.diff_id.clone(),
            size,
            media_type,
        })
    }

    pub(crate) fn from_built(layer: &LayerInfo) -> Self {
        Self {
            path: layer.path.clone(),
            digest: layer.prefixed_digest(),
            diff_id: layer.prefixed_diff_id(),
            size: layer.size,
            media_type: MEDIA_TYPE_LAYER_GZIP,
        }
    }
}

/// Everything that ends up in the image config and manifest.
#[derive(Debug, Clone)]
pub(crate) struct ImageDraft {
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub exposed_ports: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub os: String,
    pub architecture: String,
    /// Base layers followed by built layers
    pub layers: Vec<OutputLayer>,
    /// History inherited from the base image, kept verbatim
    pub base_history: Vec<HistoryEntry>,
    /// History of this build; `created` is filled in at assembly
    pub history: Vec<HistoryEntry>,
}

impl Default for ImageDraft {
    fn default() -> Self {
        Self {
            workdir: "/".to_string(),
            env: Vec::new(),
            entrypoint: None,
            cmd: None,
            user: None,
            exposed_ports: Vec::new(),
            labels: BTreeMap::new(),
            os: "linux".to_string(),
            architecture: host_architecture().to_string(),
            layers: Vec::new(),
            base_history: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// Outcome of assembly.
#[derive(Debug)]
pub(crate) struct AssembledImage {
    pub stored: StoredImage,
    pub diff_ids: Vec<String>,
}

/// OCI architecture name of the host.
pub(crate) fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Write the OCI layout for `draft` into `output_dir` and store it.
pub(crate) async fn assemble_image(
    draft: &ImageDraft,
    reference: &str,
    created: DateTime<Utc>,
    output_dir: &Path,
    store: &ImageStore,
) -> Result<AssembledImage> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        StratumError::Filesystem(format!("Failed to create {}: {}", blobs_dir.display(), e))
    })?;

    let mut descriptors = Vec::with_capacity(draft.layers.len());
    for layer in &draft.layers {
        link_or_copy(&layer.path, &blobs_dir.join(hex_of(&layer.digest)))?;
        descriptors.push(serde_json::json!({
            "mediaType": layer.media_type,
            "digest": layer.digest,
            "size": layer.size
        }));
    }

    let diff_ids: Vec<String> = draft.layers.iter().map(|l| l.diff_id.clone()).collect();
    let config_bytes = serde_json::to_vec(&image_config(draft, &diff_ids, created))?;
    let config_hex = sha256_bytes(&config_bytes);
    write_file(&blobs_dir.join(&config_hex), &config_bytes)?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST,
        "config": {
            "mediaType": MEDIA_TYPE_CONFIG,
            "digest": format!("sha256:{}", config_hex),
            "size": config_bytes.len()
        },
        "layers": descriptors
    });
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = format!("sha256:{}", sha256_bytes(&manifest_bytes));
    write_file(&blobs_dir.join(hex_of(&manifest_digest)), &manifest_bytes)?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_INDEX,
        "manifests": [{
            "mediaType": MEDIA_TYPE_MANIFEST,
            "digest": manifest_digest,
            "size": manifest_bytes.len(),
            "annotations": {"org.opencontainers.image.ref.name": reference}
        }]
    });
    write_file(&output_dir.join("index.json"), &serde_json::to_vec_pretty(&index)?)?;
    write_file(
        &output_dir.join("oci-layout"),
        br#"{"imageLayoutVersion":"1.0.0"}"#,
    )?;

    let stored = store.put(reference, &manifest_digest, output_dir).await?;
    tracing::info!(
        reference = %reference,
        digest = %manifest_digest,
        layers = draft.layers.len(),
        size_bytes = stored.size_bytes,
        "Stored built image"
    );

    let evicted = store.evict_except(reference).await?;
    if !evicted.is_empty() {
        tracing::info!(count = evicted.len(), references = ?evicted, "Evicted images from store");
    }

    Ok(AssembledImage { stored, diff_ids })
}

fn image_config(draft: &ImageDraft, diff_ids: &[String], created: DateTime<Utc>) -> serde_json::Value {
    let created = created.to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut config = serde_json::Map::new();
    if !draft.env.is_empty() {
        let env: Vec<String> = draft.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        config.insert("Env".to_string(), serde_json::json!(env));
    }
    if let Some(ref entrypoint) = draft.entrypoint {
        config.insert("Entrypoint".to_string(), serde_json::json!(entrypoint));
    }
    if let Some(ref cmd) = draft.cmd {
        config.insert("Cmd".to_string(), serde_json::json!(cmd));
    }
    if draft.workdir != "/" {
        config.insert("WorkingDir".to_string(), serde_json::json!(draft.workdir));
    }
    if let Some(ref user) = draft.user {
        config.insert("User".to_string(), serde_json::json!(user));
    }
    if !draft.exposed_ports.is_empty() {
        let ports: BTreeMap<&str, serde_json::Value> = draft
            .exposed_ports
            .iter()
            .map(|p| (p.as_str(), serde_json::json!({})))
            .collect();
        config.insert("ExposedPorts".to_string(), serde_json::json!(ports));
    }
    if !draft.labels.is_empty() {
        config.insert("Labels".to_string(), serde_json::json!(draft.labels));
    }

    let history: Vec<HistoryEntry> = draft
        .base_history
        .iter()
        .cloned()
        .chain(draft.history.iter().map(|h| HistoryEntry {
            created: Some(created.clone()),
            ..h.clone()
        }))
        .collect();

    serde_json::json!({
        "created": created,
        "architecture": draft.architecture,
        "os": draft.os,
        "config": config,
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
        "history": history
    })
}

fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        return Ok(());
    }
    if std::fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dst).map(|_| ()).map_err(|e| {
        StratumError::Filesystem(format!(
            "Failed to copy layer {} into image: {}",
            src.display(),
            e
        ))
    })
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).map_err(|e| {
        StratumError::Filesystem(format!("Failed to write {}: {}", path.display(), e))
    })
}

fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}
