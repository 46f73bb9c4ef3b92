//! Shared fixtures for builder integration tests.
//!
//! Builds run against a local image store seeded with a tiny base image
//! and a scripted installer, so no network, registry, or root is needed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use stratum_builder::build::{RunOutput, RunRequest};
use stratum_builder::oci::extract_layer;
use stratum_builder::{
    BuildConfig, BuildResult, ImageBuilder, ImageStore, LayerCache, LocalImageSource, OciImage,
    Recipe, StepExecutor,
};
use stratum_core::error::{Result, StratumError};
use tempfile::TempDir;

pub const BASE_IMAGE: &str = "python:3.12-slim";
pub const MANIFEST: &str = "requirements.txt";
pub const INSTALL: &str = "pip install -r requirements.txt";

/// Directory the fake installer puts packages in.
pub const SITE_PACKAGES: &str = "usr/lib/python3/site-packages";

/// Stand-in for a package installer.
///
/// Reads the manifest in the working directory and writes one directory
/// per requirement under `SITE_PACKAGES`. Requirements whose name starts
/// with `nonexistent` fail the way an unresolvable package does.
#[derive(Default)]
pub struct FakeInstaller {
    calls: AtomicUsize,
}

impl FakeInstaller {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for FakeInstaller {
    fn name(&self) -> &str {
        "fake-installer"
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let manifest = std::fs::read_to_string(request.host_workdir().join(MANIFEST))?;
        let site = request.rootfs.join(SITE_PACKAGES);
        let mut installed = Vec::new();

        for line in manifest.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let name = line.split("==").next().unwrap_or(line);
            if name.starts_with("nonexistent") {
                return Err(StratumError::Install {
                    command: request.command.clone(),
                    exit_code: Some(1),
                    stderr: format!("ERROR: No matching distribution found for {}", line),
                });
            }
            std::fs::create_dir_all(site.join(name))?;
            std::fs::write(site.join(name).join("METADATA"), format!("{}\n", line))?;
            installed.push(name.to_string());
        }

        Ok(RunOutput {
            stdout: format!("Successfully installed {}", installed.join(" ")),
            stderr: String::new(),
        })
    }
}

/// A store, a cache, a build context and an installer in one temp dir.
pub struct TestEnv {
    pub tmp: TempDir,
    pub store: Arc<ImageStore>,
    pub cache: Arc<LayerCache>,
    pub installer: Arc<FakeInstaller>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_store_limit(u64::MAX).await
    }

    /// Environment whose image store holds at most `max_bytes`.
    pub async fn with_store_limit(max_bytes: u64) -> Self {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("context")).unwrap();
        let store = Arc::new(ImageStore::new(&tmp.path().join("images"), max_bytes).unwrap());
        let cache = Arc::new(LayerCache::new(&tmp.path().join("cache")).unwrap());
        let env = Self {
            tmp,
            store,
            cache,
            installer: Arc::new(FakeInstaller::default()),
        };
        env.seed_base_image().await;
        env
    }

    pub fn context(&self) -> PathBuf {
        self.tmp.path().join("context")
    }

    /// Write a file into the build context.
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.context().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn builder(&self) -> ImageBuilder {
        ImageBuilder::new(
            self.store.clone(),
            self.cache.clone(),
            Arc::new(LocalImageSource::new(self.store.clone())),
            self.installer.clone(),
        )
    }

    /// Config for the canonical layered recipe with a fixed timestamp.
    pub fn layered_config(&self, tag: &str) -> BuildConfig {
        let recipe = Recipe::layered(BASE_IMAGE, "/workspace", MANIFEST, INSTALL);
        let mut config = BuildConfig::new(self.context(), recipe);
        config.tag = Some(tag.to_string());
        config.created = Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        config
    }

    pub async fn build_layered(&self, tag: &str) -> Result<BuildResult> {
        self.builder().build(self.layered_config(tag)).await
    }

    /// Unpack every layer of a stored image into a fresh directory.
    pub async fn unpack(&self, reference: &str) -> TempDir {
        let stored = self.store.get(reference).await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        let out = TempDir::new().unwrap();
        for layer in image.layers() {
            extract_layer(&layer.path, out.path()).unwrap();
        }
        out
    }

    /// Paths of every file found in any cached layer.
    pub fn cached_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for meta in self.cache.list_entries().unwrap() {
            let Some(cached) = self.cache.get(&meta.key).unwrap() else {
                continue;
            };
            let Some(layer) = cached.layer else {
                continue;
            };
            let out = TempDir::new().unwrap();
            extract_layer(&layer.path, out.path()).unwrap();
            collect_files(out.path(), out.path(), &mut files);
        }
        files
    }

    /// A base image with an interpreter stub, built from scratch.
    async fn seed_base_image(&self) {
        let base_ctx = self.tmp.path().join("base-context");
        std::fs::create_dir_all(base_ctx.join("usr/bin")).unwrap();
        std::fs::create_dir_all(base_ctx.join(SITE_PACKAGES)).unwrap();
        std::fs::write(base_ctx.join("usr/bin/python3"), "#!/bin/sh\n").unwrap();

        let recipe = Recipe::parse(
            "FROM scratch\nCOPY . /\nENV LANG=C.UTF-8\nCMD [\"python3\"]\n",
        )
        .unwrap();
        let mut config = BuildConfig::new(&base_ctx, recipe);
        config.tag = Some(BASE_IMAGE.to_string());
        config.created = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        // Seeding must not count as an install
        let seeder = ImageBuilder::new(
            self.store.clone(),
            self.cache.clone(),
            Arc::new(LocalImageSource::new(self.store.clone())),
            Arc::new(FakeInstaller::default()),
        );
        seeder.build(config).await.unwrap();
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(root, &path, files);
        } else {
            files.push(path.strip_prefix(root).unwrap().to_path_buf());
        }
    }
}
