//! Image reference parsing.
//!
//! Turns `python:3.12-slim` or `ghcr.io/org/app@sha256:...` into registry,
//! repository, tag and digest.

use stratum_core::error::{Result, StratumError};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Base name denoting an empty filesystem.
pub const SCRATCH: &str = "scratch";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if given (e.g. "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/python")
    pub repository: String,
    /// Tag, defaulted to "latest" when neither tag nor digest is given
    pub tag: Option<String>,
    /// Content digest ("sha256:...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference.
    ///
    /// Single-component names live under `library/` on Docker Hub. The
    /// first path component is a registry only if it contains `.` or `:`,
    /// or is `localhost`.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StratumError::OciImage("Empty image reference".to_string()));
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(StratumError::OciImage(format!(
                        "Invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only appear in the last path component. A colon
        // in a single-component name followed by digits is a registry port.
        let last_start = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_start..].rfind(':') {
            Some(i) => {
                let colon = last_start + i;
                let candidate = &rest[colon + 1..];
                let is_port = last_start == 0
                    && digest.is_none()
                    && !candidate.is_empty()
                    && candidate.chars().all(|c| c.is_ascii_digit());
                if is_port {
                    (rest, None)
                } else {
                    (&rest[..colon], Some(candidate.to_string()))
                }
            }
            None => (rest, None),
        };

        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(StratumError::OciImage(format!(
                "Invalid image reference '{}'",
                reference
            )));
        }

        let (registry, repository) = split_registry(name);
        if repository.is_empty() {
            return Err(StratumError::OciImage(format!(
                "Empty repository in reference '{}'",
                reference
            )));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Fully-qualified form, e.g. `docker.io/library/python:3.12`.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

fn split_registry(name: &str) -> (String, String) {
    if let Some((first, repo)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), repo.to_string());
        }
        return (DEFAULT_REGISTRY.to_string(), name.to_string());
    }
    (DEFAULT_REGISTRY.to_string(), format!("library/{}", name))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}
