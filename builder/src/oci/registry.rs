//! Registry client for fetching base images.
//!
//! Uses `oci-distribution` to download a manifest, its config and layers,
//! and writes them out as an OCI image layout.

use std::path::Path;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{
    ImageIndexEntry, OciDescriptor, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};
use stratum_core::error::{Result, StratumError};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;

/// Registry credentials.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`.
    ///
    /// Anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Downloads images from a registry.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPuller {
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Pull `reference` into an OCI layout at `target_dir`.
    ///
    /// Multi-platform indexes resolve to linux on the host architecture.
    /// Returns the manifest digest.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let registry = reference.registry.as_str();
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(reference = %reference, "Pulling base image");

        let blobs_dir = target_dir.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs_dir)
            .await
            .map_err(|e| registry_error(registry, format!("Failed to create {}: {}", blobs_dir.display(), e)))?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_error(registry, format!("Failed to pull manifest: {}", e)))?;

        // The blob must be the registry's bytes so it hashes to its digest
        let by_digest = Reference::with_digest(
            oci_ref.registry().to_string(),
            oci_ref.repository().to_string(),
            manifest_digest.clone(),
        );
        let (manifest_json, _) = self
            .client
            .pull_manifest_raw(
                &by_digest,
                &auth,
                &[OCI_IMAGE_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE],
            )
            .await
            .map_err(|e| registry_error(registry, format!("Failed to pull manifest: {}", e)))?;
        if !digest_matches(&manifest_json, &manifest_digest) {
            return Err(registry_error(
                registry,
                format!("Manifest content does not match digest {}", manifest_digest),
            ));
        }
        write_blob(&blobs_dir, &manifest_digest, &manifest_json, registry).await?;

        self.pull_blob_to_file(&oci_ref, &manifest.config, &blobs_dir, registry)
            .await?;
        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            self.pull_blob_to_file(&oci_ref, layer, &blobs_dir, registry)
                .await?;
        }

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": manifest.media_type.as_deref().unwrap_or(OCI_IMAGE_MEDIA_TYPE),
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        tokio::fs::write(target_dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)
            .await?;
        tokio::fs::write(target_dir.join("index.json"), serde_json::to_vec_pretty(&index)?)
            .await?;

        tracing::info!(reference = %reference, digest = %manifest_digest, "Base image pulled");
        Ok(manifest_digest)
    }

    /// Resolve the manifest digest without downloading content.
    pub async fn manifest_digest(&self, reference: &ImageReference) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let (_manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| {
                registry_error(&reference.registry, format!("Failed to pull manifest: {}", e))
            })?;
        Ok(digest)
    }

    async fn pull_blob_to_file(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
        registry: &str,
    ) -> Result<()> {
        let path = blobs_dir.join(hex_of(&descriptor.digest));
        let mut file = tokio::fs::File::create(&path).await?;
        self.client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| {
                registry_error(registry, format!("Failed to pull blob {}: {}", descriptor.digest, e))
            })?;
        file.flush().await?;
        Ok(())
    }
}

async fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8], registry: &str) -> Result<()> {
    tokio::fs::write(blobs_dir.join(hex_of(digest)), data)
        .await
        .map_err(|e| registry_error(registry, format!("Failed to write blob {}: {}", digest, e)))
}

/// Whether `data` hashes to the `sha256:` digest.
fn digest_matches(data: &[u8], digest: &str) -> bool {
    let actual = format!("sha256:{}", hex::encode(Sha256::digest(data)));
    actual == digest
}

fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn registry_error(registry: &str, message: String) -> StratumError {
    StratumError::Registry {
        registry: registry.to_string(),
        message,
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        StratumError::OciImage(format!("Invalid image reference '{}': {}", ref_str, e))
    })
}

/// Pick the linux manifest matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
