//! Build engine.
//!
//! Runs a recipe step by step against a temporary rootfs. Each step's cache
//! key is chained from the key of the step before it, so a step is reused
//! only while it and every earlier step are unchanged. The first failing
//! step aborts the build and nothing is stored.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratum_core::error::{Result, StratumError};
use stratum_core::event::{events, BuildEvent, EventEmitter};

use super::assemble::{assemble_image, host_architecture, ImageDraft, OutputLayer};
use super::context::BuildContext;
use super::executor::{RunRequest, StepExecutor};
use super::layer::{create_layer, sha256_bytes, DirSnapshot, EntryKind, LayerInfo};
use super::recipe::{Instruction, Recipe};
use crate::cache::{chain_key, CachedLayer, LayerCache};
use crate::oci::{extract_layer, BaseImageSource, HistoryEntry, ImageReference, ImageStore, SCRATCH};

/// Tag used when a build does not name one.
pub const DEFAULT_TAG: &str = "stratum-build:latest";

/// Configuration for a build operation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build context directory; COPY sources resolve inside it
    pub context_dir: PathBuf,
    /// Parsed recipe
    pub recipe: Recipe,
    /// Image tag, `DEFAULT_TAG` when unset
    pub tag: Option<String>,
    /// Values for declared ARGs
    pub build_args: HashMap<String, String>,
    /// Skip cache lookups (results are still cached)
    pub no_cache: bool,
    /// Image creation time, now when unset
    pub created: Option<DateTime<Utc>>,
}

impl BuildConfig {
    pub fn new(context_dir: impl Into<PathBuf>, recipe: Recipe) -> Self {
        Self {
            context_dir: context_dir.into(),
            recipe,
            tag: None,
            build_args: HashMap::new(),
            no_cache: false,
            created: None,
        }
    }
}

/// How a step was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    /// The step ran and its result was cached
    Executed,
    /// A cached result was applied
    Cached,
    /// Configuration-only step
    Metadata,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Executed => "executed",
            StepOutcome::Cached => "cached",
            StepOutcome::Metadata => "metadata",
        }
    }
}

/// Per-step record of a finished build.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based step number
    pub index: usize,
    /// Instruction text after variable expansion
    pub instruction: String,
    pub outcome: StepOutcome,
    pub cache_key: String,
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    /// Image reference stored in the image store
    pub reference: String,
    /// Manifest digest
    pub digest: String,
    /// Stored image size in bytes
    pub size: u64,
    /// Number of layers, base layers included
    pub layer_count: usize,
    /// Uncompressed layer digests in order
    pub diff_ids: Vec<String>,
    pub steps: Vec<StepReport>,
}

/// Builds images from recipes.
pub struct ImageBuilder {
    store: Arc<ImageStore>,
    cache: Arc<LayerCache>,
    source: Arc<dyn BaseImageSource>,
    executor: Arc<dyn StepExecutor>,
    events: Option<EventEmitter>,
}

/// Mutable state accumulated during the build.
#[derive(Default)]
struct BuildState {
    draft: ImageDraft,
    /// Cache key of the last step
    key: String,
    from_seen: bool,
    /// ARG values declared before FROM
    global_args: BTreeMap<String, String>,
    /// ARG values in scope after FROM
    args: BTreeMap<String, String>,
    /// CMD came from the base image and is reset by ENTRYPOINT
    cmd_from_base: bool,
}

impl BuildState {
    fn lookup(&self, name: &str) -> Option<String> {
        if !self.from_seen {
            return self.global_args.get(name).cloned();
        }
        self.draft
            .env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .or_else(|| self.args.get(name).cloned())
    }

    /// Image env plus ARG values for RUN steps.
    fn run_env(&self) -> Vec<(String, String)> {
        let mut env = self.draft.env.clone();
        for (name, value) in &self.args {
            if !env.iter().any(|(k, _)| k == name) {
                env.push((name.clone(), value.clone()));
            }
        }
        env
    }

    fn set_env(&mut self, key: &str, value: &str) {
        match self.draft.env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.draft.env.push((key.to_string(), value.to_string())),
        }
    }
}

/// Paths shared by every step of one build.
struct StepScope<'a> {
    config: &'a BuildConfig,
    context: &'a BuildContext,
    rootfs: &'a Path,
    layers_dir: &'a Path,
}

impl ImageBuilder {
    pub fn new(
        store: Arc<ImageStore>,
        cache: Arc<LayerCache>,
        source: Arc<dyn BaseImageSource>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            store,
            cache,
            source,
            executor,
            events: None,
        }
    }

    /// Broadcast build progress on `emitter`.
    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.events = Some(emitter);
        self
    }

    /// Execute a full build and store the image under its tag.
    ///
    /// # Process
    ///
    /// 1. Resolve the base image and extract it into a temporary rootfs
    /// 2. Run each step, applying cached layers where the key chain matches
    /// 3. Assemble the OCI layout and put it in the image store
    pub async fn build(&self, config: BuildConfig) -> Result<BuildResult> {
        let reference = config.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string());
        self.emit(
            events::BUILD_STARTED,
            &[
                ("reference", serde_json::json!(reference)),
                ("steps", serde_json::json!(config.recipe.instructions.len())),
            ],
        );

        match self.execute(&config, &reference).await {
            Ok(result) => {
                tracing::info!(
                    reference = %result.reference,
                    digest = %result.digest,
                    layers = result.layer_count,
                    "Build completed"
                );
                self.emit(
                    events::BUILD_COMPLETED,
                    &[
                        ("reference", serde_json::json!(result.reference)),
                        ("digest", serde_json::json!(result.digest)),
                        ("size", serde_json::json!(result.size)),
                    ],
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "Build failed");
                self.emit(
                    events::BUILD_FAILED,
                    &[
                        ("reference", serde_json::json!(reference)),
                        ("error", serde_json::json!(e.to_string())),
                    ],
                );
                Err(e)
            }
        }
    }

    async fn execute(&self, config: &BuildConfig, reference: &str) -> Result<BuildResult> {
        ImageReference::parse(reference)?;
        let context = BuildContext::open(&config.context_dir)?;

        for warning in config.recipe.layering_warnings() {
            tracing::warn!("{}", warning);
        }
        warn_unused_build_args(config);

        // Removed on drop, so a failed build leaves no rootfs behind
        let workspace = tempfile::Builder::new()
            .prefix("stratum-build-")
            .tempdir()
            .map_err(|e| {
                StratumError::Filesystem(format!("Failed to create build directory: {}", e))
            })?;
        let rootfs = workspace.path().join("rootfs");
        let layers_dir = workspace.path().join("layers");
        let output_dir = workspace.path().join("output");
        for dir in [&rootfs, &layers_dir, &output_dir] {
            create_dir_all(dir)?;
        }

        let scope = StepScope {
            config,
            context: &context,
            rootfs: &rootfs,
            layers_dir: &layers_dir,
        };
        let mut state = BuildState::default();
        let total = config.recipe.instructions.len();
        let mut steps = Vec::with_capacity(total);

        for (idx, instruction) in config.recipe.instructions.iter().enumerate() {
            let index = idx + 1;
            let expanded = expand_instruction(instruction, |name| state.lookup(name));
            let text = expanded.to_string();

            tracing::info!(step = index, total, "Step {}/{}: {}", index, total, text);
            self.emit(
                events::STEP_STARTED,
                &[
                    ("index", serde_json::json!(index)),
                    ("total", serde_json::json!(total)),
                    ("instruction", serde_json::json!(text)),
                ],
            );

            let outcome = self
                .run_step(&scope, &mut state, index, &expanded, &text)
                .await?;

            let event = match outcome {
                StepOutcome::Cached => events::STEP_CACHED,
                _ => events::STEP_COMPLETED,
            };
            self.emit(
                event,
                &[
                    ("index", serde_json::json!(index)),
                    ("instruction", serde_json::json!(text)),
                    ("outcome", serde_json::json!(outcome.as_str())),
                    ("cache_key", serde_json::json!(state.key)),
                ],
            );
            steps.push(StepReport {
                index,
                instruction: text,
                outcome,
                cache_key: state.key.clone(),
            });
        }

        let created = config.created.unwrap_or_else(Utc::now);
        let assembled =
            assemble_image(&state.draft, reference, created, &output_dir, &self.store).await?;

        Ok(BuildResult {
            reference: assembled.stored.reference,
            digest: assembled.stored.digest,
            size: assembled.stored.size_bytes,
            layer_count: state.draft.layers.len(),
            diff_ids: assembled.diff_ids,
            steps,
        })
    }

    async fn run_step(
        &self,
        scope: &StepScope<'_>,
        state: &mut BuildState,
        index: usize,
        instruction: &Instruction,
        text: &str,
    ) -> Result<StepOutcome> {
        match instruction {
            Instruction::From { image, .. } => {
                self.handle_from(scope, state, image, text).await?;
                Ok(StepOutcome::Metadata)
            }
            Instruction::Workdir { path } => self.handle_workdir(scope, state, index, path, text),
            Instruction::Copy { src, dst, .. } => {
                self.handle_copy(scope, state, index, src, dst, text)
            }
            Instruction::Run { command } => {
                self.handle_run(scope, state, index, command, text).await
            }
            other => {
                let input = apply_metadata(scope.config, state, other);
                state.key = chain_key(&state.key, text, &input);
                if state.from_seen {
                    state.draft.history.push(HistoryEntry {
                        created_by: Some(text.to_string()),
                        empty_layer: true,
                        ..Default::default()
                    });
                }
                Ok(StepOutcome::Metadata)
            }
        }
    }

    async fn handle_from(
        &self,
        scope: &StepScope<'_>,
        state: &mut BuildState,
        image: &str,
        text: &str,
    ) -> Result<()> {
        state.from_seen = true;

        if image == SCRATCH {
            state.key = chain_key(&state.key, text, SCRATCH);
            return Ok(());
        }

        let base = self.source.resolve(image).await?;
        tracing::info!(
            image,
            digest = %base.manifest_digest(),
            layers = base.layers().len(),
            "Resolved base image"
        );

        for layer in base.layers() {
            extract_layer(&layer.path, scope.rootfs)?;
            state.draft.layers.push(OutputLayer::from_base(layer)?);
        }

        let config = base.config();
        let draft = &mut state.draft;
        draft.env = config.env.clone();
        draft.cmd = config.cmd.clone();
        draft.entrypoint = config.entrypoint.clone();
        draft.user = config.user.clone();
        draft.exposed_ports = config.exposed_ports.clone();
        draft.labels = config.labels.clone().into_iter().collect();
        draft.workdir = config
            .working_dir
            .clone()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| "/".to_string());
        if !config.os.is_empty() {
            draft.os = config.os.clone();
        }
        draft.architecture = if config.architecture.is_empty() {
            host_architecture().to_string()
        } else {
            config.architecture.clone()
        };
        draft.base_history = base.history().to_vec();
        state.cmd_from_base = draft.cmd.is_some();

        state.key = chain_key(&state.key, text, base.manifest_digest());
        Ok(())
    }

    fn handle_workdir(
        &self,
        scope: &StepScope<'_>,
        state: &mut BuildState,
        index: usize,
        path: &str,
        text: &str,
    ) -> Result<StepOutcome> {
        let workdir = resolve_path(&state.draft.workdir, path);
        let key = chain_key(&state.key, text, &workdir);

        let outcome = match self.lookup(scope, &key)? {
            Some(cached) => {
                apply_cached(&cached, scope.rootfs)?;
                record_step(state, cached.layer.as_ref(), text);
                StepOutcome::Cached
            }
            None => {
                let mut created = Vec::new();
                ensure_dirs(scope.rootfs, &rootfs_relative(&workdir), &mut created)?;
                let layer = if created.is_empty() {
                    None
                } else {
                    Some(create_layer(
                        scope.rootfs,
                        &created,
                        &[],
                        &layer_path(scope.layers_dir, index),
                    )?)
                };
                self.commit(state, &key, layer.as_ref(), text)?;
                StepOutcome::Executed
            }
        };

        state.draft.workdir = workdir;
        state.key = key;
        Ok(outcome)
    }

    fn handle_copy(
        &self,
        scope: &StepScope<'_>,
        state: &mut BuildState,
        index: usize,
        src: &[String],
        dst: &str,
        text: &str,
    ) -> Result<StepOutcome> {
        let dst_abs = resolve_path(&state.draft.workdir, dst);
        let input = scope.context.digest(src)?;
        let key = chain_key(&state.key, &format!("{} -> {}", text, dst_abs), &input);

        let outcome = match self.lookup(scope, &key)? {
            Some(cached) => {
                apply_cached(&cached, scope.rootfs)?;
                record_step(state, cached.layer.as_ref(), text);
                StepOutcome::Cached
            }
            None => {
                let dst_rel = rootfs_relative(&dst_abs);
                let dst_is_dir = dst.ends_with('/')
                    || dst == "."
                    || src.len() > 1
                    || scope.rootfs.join(&dst_rel).is_dir();

                let mut written = Vec::new();
                for source in src {
                    copy_source(scope, source, &dst_rel, dst_is_dir, &mut written)?;
                }
                written.sort();
                written.dedup();
                tracing::debug!(paths = written.len(), dst = %dst_abs, "Copied context files");

                let layer = if written.is_empty() {
                    None
                } else {
                    Some(create_layer(
                        scope.rootfs,
                        &written,
                        &[],
                        &layer_path(scope.layers_dir, index),
                    )?)
                };
                self.commit(state, &key, layer.as_ref(), text)?;
                StepOutcome::Executed
            }
        };

        state.key = key;
        Ok(outcome)
    }

    async fn handle_run(
        &self,
        scope: &StepScope<'_>,
        state: &mut BuildState,
        index: usize,
        command: &str,
        text: &str,
    ) -> Result<StepOutcome> {
        let env = state.run_env();
        let input = run_input(&state.draft.workdir, state.draft.user.as_deref(), &env);
        let key = chain_key(&state.key, text, &input);

        let outcome = match self.lookup(scope, &key)? {
            Some(cached) => {
                apply_cached(&cached, scope.rootfs)?;
                record_step(state, cached.layer.as_ref(), text);
                StepOutcome::Cached
            }
            None => {
                let before = DirSnapshot::capture(scope.rootfs)?;
                let request = RunRequest {
                    command: command.to_string(),
                    rootfs: scope.rootfs.to_path_buf(),
                    workdir: state.draft.workdir.clone(),
                    env,
                    user: state.draft.user.clone(),
                };
                create_dir_all(&request.host_workdir())?;

                tracing::debug!(executor = self.executor.name(), command, "Running step");
                let output = self.executor.run(&request).await?;
                if !output.stdout.is_empty() {
                    tracing::debug!(stdout = %output.stdout.trim_end(), "Step output");
                }

                let diff = before.diff(&DirSnapshot::capture(scope.rootfs)?);
                let layer = if diff.is_empty() {
                    None
                } else {
                    Some(create_layer(
                        scope.rootfs,
                        &diff.changed,
                        &diff.removed,
                        &layer_path(scope.layers_dir, index),
                    )?)
                };
                self.commit(state, &key, layer.as_ref(), text)?;
                StepOutcome::Executed
            }
        };

        state.key = key;
        Ok(outcome)
    }

    fn lookup(&self, scope: &StepScope<'_>, key: &str) -> Result<Option<CachedLayer>> {
        if scope.config.no_cache {
            return Ok(None);
        }
        self.cache.get(key)
    }

    /// Cache a freshly built step and add it to the image.
    fn commit(
        &self,
        state: &mut BuildState,
        key: &str,
        layer: Option<&LayerInfo>,
        text: &str,
    ) -> Result<()> {
        let cached = self.cache.put(key, layer, text)?;
        record_step(state, cached.layer.as_ref(), text);
        Ok(())
    }

    fn emit(&self, key: &str, fields: &[(&str, serde_json::Value)]) {
        if let Some(ref events) = self.events {
            let map = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            events.emit(BuildEvent::with_map(key, map));
        }
    }
}

/// Apply a configuration-only instruction; returns its cache key input.
fn apply_metadata(config: &BuildConfig, state: &mut BuildState, instruction: &Instruction) -> String {
    match instruction {
        Instruction::Env { vars } => {
            for (key, value) in vars {
                state.set_env(key, value);
            }
            String::new()
        }
        Instruction::Arg { name, default } => {
            let value = config
                .build_args
                .get(name)
                .cloned()
                .or_else(|| default.clone())
                .or_else(|| {
                    if state.from_seen {
                        state.global_args.get(name).cloned()
                    } else {
                        None
                    }
                });
            // Pre-FROM values are only visible to FROM and later redeclarations
            let scope = if state.from_seen {
                &mut state.args
            } else {
                &mut state.global_args
            };
            match &value {
                Some(v) => {
                    scope.insert(name.clone(), v.clone());
                }
                None => {
                    scope.remove(name);
                }
            }
            value.unwrap_or_default()
        }
        Instruction::Label { labels } => {
            for (key, value) in labels {
                state.draft.labels.insert(key.clone(), value.clone());
            }
            String::new()
        }
        Instruction::Cmd { exec } => {
            state.draft.cmd = Some(exec.clone());
            state.cmd_from_base = false;
            String::new()
        }
        Instruction::Entrypoint { exec } => {
            state.draft.entrypoint = Some(exec.clone());
            if state.cmd_from_base {
                state.draft.cmd = None;
                state.cmd_from_base = false;
            }
            String::new()
        }
        Instruction::Expose { port } => {
            let port = if port.contains('/') {
                port.clone()
            } else {
                format!("{}/tcp", port)
            };
            if !state.draft.exposed_ports.contains(&port) {
                state.draft.exposed_ports.push(port);
            }
            String::new()
        }
        Instruction::User { user } => {
            state.draft.user = Some(user.clone());
            String::new()
        }
        Instruction::From { .. }
        | Instruction::Workdir { .. }
        | Instruction::Copy { .. }
        | Instruction::Run { .. } => String::new(),
    }
}

fn warn_unused_build_args(config: &BuildConfig) {
    let declared: HashSet<&str> = config
        .recipe
        .instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::Arg { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    let mut unused: Vec<&str> = config
        .build_args
        .keys()
        .map(String::as_str)
        .filter(|name| !declared.contains(name))
        .collect();
    unused.sort();
    if !unused.is_empty() {
        tracing::warn!(args = ?unused, "Build args were not consumed by any ARG");
    }
}

fn apply_cached(cached: &CachedLayer, rootfs: &Path) -> Result<()> {
    if let Some(ref layer) = cached.layer {
        tracing::debug!(key = %cached.key, digest = %layer.digest, "Applying cached layer");
        extract_layer(&layer.path, rootfs)?;
    }
    Ok(())
}

fn record_step(state: &mut BuildState, layer: Option<&LayerInfo>, text: &str) {
    if let Some(layer) = layer {
        state.draft.layers.push(OutputLayer::from_built(layer));
    }
    state.draft.history.push(HistoryEntry {
        created_by: Some(text.to_string()),
        empty_layer: layer.is_none(),
        ..Default::default()
    });
}

/// Copy one COPY source from the context into the rootfs.
fn copy_source(
    scope: &StepScope<'_>,
    source: &str,
    dst_rel: &Path,
    dst_is_dir: bool,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in scope.context.walk(source)? {
        let target = if entry.relative.as_os_str().is_empty() {
            match entry.kind {
                EntryKind::Dir => dst_rel.to_path_buf(),
                _ if dst_is_dir => {
                    let name = entry.path.file_name().ok_or_else(|| {
                        StratumError::Filesystem(format!("COPY source '{}' has no file name", source))
                    })?;
                    dst_rel.join(name)
                }
                _ => dst_rel.to_path_buf(),
            }
        } else {
            dst_rel.join(&entry.relative)
        };

        match entry.kind {
            EntryKind::Dir => ensure_dirs(scope.rootfs, &target, written)?,
            EntryKind::File | EntryKind::Symlink => {
                if let Some(parent) = target.parent() {
                    ensure_dirs(scope.rootfs, parent, written)?;
                }
                copy_entry(&entry.path, &scope.rootfs.join(&target), entry.kind)?;
                written.push(target);
            }
        }
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, kind: EntryKind) -> Result<()> {
    match std::fs::symlink_metadata(dst) {
        Ok(m) if m.is_dir() => {
            return Err(StratumError::Filesystem(format!(
                "Cannot copy {} over directory {}",
                src.display(),
                dst.display()
            )))
        }
        Ok(_) => std::fs::remove_file(dst).map_err(|e| fs_error("remove", dst, e))?,
        Err(_) => {}
    }

    if kind == EntryKind::Symlink {
        let target = std::fs::read_link(src).map_err(|e| fs_error("read link", src, e))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dst).map_err(|e| fs_error("create symlink", dst, e))?;
        #[cfg(not(unix))]
        return Err(StratumError::Filesystem(format!(
            "Symlink {} -> {} is not supported on this platform",
            src.display(),
            target.display()
        )));
    } else {
        std::fs::copy(src, dst).map_err(|e| fs_error("copy", src, e))?;
    }
    Ok(())
}

/// Create every missing directory of `rel` under `rootfs`, recording the
/// ones created.
fn ensure_dirs(rootfs: &Path, rel: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    let mut current = PathBuf::new();
    for component in rel.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        current.push(part);
        let host = rootfs.join(&current);
        match std::fs::symlink_metadata(&host) {
            Ok(m) if m.is_dir() => {}
            Ok(m) if m.file_type().is_symlink() => {
                // Relative links like lib -> usr/lib stay inside the rootfs
                let target = std::fs::read_link(&host).map_err(|e| fs_error("read link", &host, e))?;
                if target.is_absolute() || !host.is_dir() {
                    return Err(StratumError::Filesystem(format!(
                        "/{} is a symlink that cannot be used as a directory",
                        current.display()
                    )));
                }
            }
            Ok(_) => {
                return Err(StratumError::Filesystem(format!(
                    "/{} exists and is not a directory",
                    current.display()
                )))
            }
            Err(_) => {
                std::fs::create_dir(&host).map_err(|e| fs_error("create", &host, e))?;
                created.push(current.clone());
            }
        }
    }
    Ok(())
}

fn create_dir_all(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| fs_error("create", path, e))
}

fn fs_error(action: &str, path: &Path, e: std::io::Error) -> StratumError {
    StratumError::Filesystem(format!("Failed to {} {}: {}", action, path.display(), e))
}

fn layer_path(layers_dir: &Path, index: usize) -> PathBuf {
    layers_dir.join(format!("step-{:03}.tar.gz", index))
}

fn rootfs_relative(abs: &str) -> PathBuf {
    PathBuf::from(abs.trim_start_matches('/'))
}

/// Digest of what a RUN step sees besides its command.
fn run_input(workdir: &str, user: Option<&str>, env: &[(String, String)]) -> String {
    let mut buf = format!("workdir={}\0user={}\0", workdir, user.unwrap_or(""));
    for (key, value) in env {
        buf.push_str(&format!("{}={}\0", key, value));
    }
    sha256_bytes(buf.as_bytes())
}

/// Resolve `path` against the absolute directory `current`.
///
/// `.` and `..` are normalised; `..` never climbs above `/`.
pub(crate) fn resolve_path(current: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", current, path)
    };
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Expand `$NAME` and `${NAME}` references.
///
/// Unknown names are left as written and `\$` yields a literal `$`.
pub(crate) fn expand_vars<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                match lookup(&name) {
                    Some(value) if closed => out.push_str(&value),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            '$' if chars.peek().map_or(false, |n| n.is_ascii_alphabetic() || *n == '_') => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match lookup(&name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            other => out.push(other),
        }
    }

    out
}

/// Expand variables in the instruction fields Docker expands.
///
/// RUN, CMD and ENTRYPOINT are left to the shell at run time.
fn expand_instruction<F>(instruction: &Instruction, lookup: F) -> Instruction
where
    F: Fn(&str) -> Option<String>,
{
    let x = |s: &str| expand_vars(s, &lookup);
    let pairs = |pairs: &[(String, String)]| -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.clone(), x(v))).collect()
    };

    match instruction {
        Instruction::From { image, alias } => Instruction::From {
            image: x(image),
            alias: alias.clone(),
        },
        Instruction::Workdir { path } => Instruction::Workdir { path: x(path) },
        Instruction::Copy { src, dst, chown } => Instruction::Copy {
            src: src.iter().map(|s| x(s)).collect(),
            dst: x(dst),
            chown: chown.as_deref().map(x),
        },
        Instruction::Env { vars } => Instruction::Env { vars: pairs(vars) },
        Instruction::Arg { name, default } => Instruction::Arg {
            name: name.clone(),
            default: default.as_deref().map(x),
        },
        Instruction::Label { labels } => Instruction::Label {
            labels: pairs(labels),
        },
        Instruction::Expose { port } => Instruction::Expose { port: x(port) },
        Instruction::User { user } => Instruction::User { user: x(user) },
        Instruction::Run { .. } | Instruction::Cmd { .. } | Instruction::Entrypoint { .. } => {
            instruction.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::executor::RunOutput;
    use crate::oci::image::tests::write_test_image;
    use crate::oci::{LocalImageSource, OciImage};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Records each command as a file under the workdir.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for RecordingExecutor {
        fn name(&self) -> &str {
            "recording"
        }

        async fn run(&self, request: &RunRequest) -> Result<RunOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if request.command.contains("fail") {
                return Err(StratumError::Install {
                    command: request.command.clone(),
                    exit_code: Some(1),
                    stderr: "no matching distribution".to_string(),
                });
            }
            let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            std::fs::write(
                request.host_workdir().join("ran.txt"),
                format!("{}\n{}\n", request.command, env.join(" ")),
            )?;
            Ok(RunOutput {
                stdout: format!("call {}", n),
                stderr: String::new(),
            })
        }
    }

    struct Fixture {
        tmp: TempDir,
        store: Arc<ImageStore>,
        cache: Arc<LayerCache>,
        executor: Arc<RecordingExecutor>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            std::fs::create_dir_all(tmp.path().join("ctx/src")).unwrap();
            std::fs::write(tmp.path().join("ctx/requirements.txt"), "requests==2.31\n").unwrap();
            std::fs::write(tmp.path().join("ctx/src/app.py"), "print('hi')\n").unwrap();
            let store = Arc::new(ImageStore::new(&tmp.path().join("images"), u64::MAX).unwrap());
            let cache = Arc::new(LayerCache::new(&tmp.path().join("cache")).unwrap());
            Self {
                tmp,
                store,
                cache,
                executor: Arc::new(RecordingExecutor::default()),
            }
        }

        fn builder(&self) -> ImageBuilder {
            ImageBuilder::new(
                self.store.clone(),
                self.cache.clone(),
                Arc::new(LocalImageSource::new(self.store.clone())),
                self.executor.clone(),
            )
        }

        fn config(&self, recipe: &str) -> BuildConfig {
            let mut config = BuildConfig::new(self.tmp.path().join("ctx"), Recipe::parse(recipe).unwrap());
            config.tag = Some("app:test".to_string());
            config.created = Some(Utc.timestamp_opt(0, 0).unwrap());
            config
        }

        fn calls(&self) -> usize {
            self.executor.calls.load(Ordering::SeqCst)
        }
    }

    const LAYERED: &str = "FROM scratch\nWORKDIR /workspace\nCOPY requirements.txt ./\nRUN install\nCOPY . .\n";

    fn outcomes(result: &BuildResult) -> Vec<StepOutcome> {
        result.steps.iter().map(|s| s.outcome).collect()
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/", "workspace"), "/workspace");
        assert_eq!(resolve_path("/workspace", "."), "/workspace");
        assert_eq!(resolve_path("/workspace", "./"), "/workspace");
        assert_eq!(resolve_path("/workspace", "src/../lib"), "/workspace/lib");
        assert_eq!(resolve_path("/workspace", "/opt"), "/opt");
        assert_eq!(resolve_path("/", "../.."), "/");
    }

    #[test]
    fn test_expand_vars() {
        let lookup = |name: &str| match name {
            "VERSION" => Some("3.12".to_string()),
            "DIR" => Some("/srv".to_string()),
            _ => None,
        };
        assert_eq!(expand_vars("python:$VERSION", &lookup), "python:3.12");
        assert_eq!(expand_vars("${DIR}/app", &lookup), "/srv/app");
        assert_eq!(expand_vars("$UNKNOWN/x", &lookup), "$UNKNOWN/x");
        assert_eq!(expand_vars("${UNKNOWN}", &lookup), "${UNKNOWN}");
        assert_eq!(expand_vars("\\$VERSION", &lookup), "$VERSION");
        assert_eq!(expand_vars("cost $5", &lookup), "cost $5");
        assert_eq!(expand_vars("${DIR", &lookup), "${DIR");
    }

    #[tokio::test]
    async fn test_layered_build_outcomes() {
        let fx = Fixture::new();
        let result = fx.builder().build(fx.config(LAYERED)).await.unwrap();

        assert_eq!(
            outcomes(&result),
            vec![
                StepOutcome::Metadata,
                StepOutcome::Executed,
                StepOutcome::Executed,
                StepOutcome::Executed,
                StepOutcome::Executed,
            ]
        );
        assert_eq!(result.reference, "app:test");
        assert_eq!(result.layer_count, 4);
        assert_eq!(result.diff_ids.len(), 4);
        assert_eq!(fx.calls(), 1);
        assert!(fx.store.get("app:test").await.is_some());
    }

    #[tokio::test]
    async fn test_rebuild_reuses_every_step() {
        let fx = Fixture::new();
        let first = fx.builder().build(fx.config(LAYERED)).await.unwrap();
        let second = fx.builder().build(fx.config(LAYERED)).await.unwrap();

        assert!(second.steps[1..].iter().all(|s| s.outcome == StepOutcome::Cached));
        assert_eq!(fx.calls(), 1);
        assert_eq!(first.diff_ids, second.diff_ids);
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn test_no_cache_runs_again() {
        let fx = Fixture::new();
        fx.builder().build(fx.config(LAYERED)).await.unwrap();

        let mut config = fx.config(LAYERED);
        config.no_cache = true;
        let result = fx.builder().build(config).await.unwrap();

        assert_eq!(result.steps[3].outcome, StepOutcome::Executed);
        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_stores_nothing() {
        let fx = Fixture::new();
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let recipe = "FROM scratch\nWORKDIR /workspace\nCOPY requirements.txt ./\nRUN fail\nCOPY . .\n";

        let err = fx
            .builder()
            .with_events(events)
            .build(fx.config(recipe))
            .await
            .unwrap_err();

        assert!(matches!(err, StratumError::Install { exit_code: Some(1), .. }));
        assert!(fx.store.list().await.is_empty());

        let mut keys = Vec::new();
        while let Ok(event) = rx.try_recv() {
            keys.push(event.key);
        }
        assert_eq!(keys.last().map(String::as_str), Some(events::BUILD_FAILED));
        // The source copy never started
        assert_eq!(keys.iter().filter(|k| *k == events::STEP_STARTED).count(), 4);
    }

    #[tokio::test]
    async fn test_unknown_base_is_resolution_error() {
        let fx = Fixture::new();
        let recipe = "FROM doesnotexist:9.9\nRUN install\n";

        let err = fx.builder().build(fx.config(recipe)).await.unwrap_err();
        assert!(matches!(err, StratumError::Resolution { .. }));
        assert_eq!(fx.calls(), 0);
        assert!(fx.cache.list_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_base_config_inherited() {
        let fx = Fixture::new();
        let layout = fx.tmp.path().join("base");
        let digest = write_test_image(&layout);
        fx.store.put("python:3.12", &digest, &layout).await.unwrap();

        let recipe = "FROM python:3.12\nENV APP=demo\nCOPY src/app.py .\nEXPOSE 8000\n";
        let result = fx.builder().build(fx.config(recipe)).await.unwrap();
        assert_eq!(result.layer_count, 2);

        let stored = fx.store.get("app:test").await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        assert_eq!(image.working_dir(), Some("/srv"));
        assert_eq!(image.label("maintainer"), Some("ops"));
        assert!(image.env().iter().any(|(k, _)| k == "PATH"));
        assert!(image.env().contains(&("APP".to_string(), "demo".to_string())));
        assert_eq!(image.config().cmd, Some(vec!["python3".to_string()]));
        assert_eq!(image.config().exposed_ports, vec!["8000/tcp".to_string()]);

        let created_by: Vec<_> = image
            .history()
            .iter()
            .filter_map(|h| h.created_by.as_deref())
            .collect();
        assert!(created_by.contains(&"COPY src/app.py ."));
    }

    #[tokio::test]
    async fn test_build_args_expand_and_reach_run() {
        let fx = Fixture::new();
        let recipe = "ARG BASE=scratch\nFROM $BASE\nARG CHANNEL=stable\nWORKDIR /opt/${CHANNEL}\nRUN install\n";
        let mut config = fx.config(recipe);
        config.build_args.insert("CHANNEL".to_string(), "nightly".to_string());

        let result = fx.builder().build(config).await.unwrap();
        assert_eq!(result.steps[1].instruction, "FROM scratch");
        assert_eq!(result.steps[3].instruction, "WORKDIR /opt/nightly");
        assert_eq!(fx.calls(), 1);
    }

    #[tokio::test]
    async fn test_entrypoint_resets_base_cmd() {
        let fx = Fixture::new();
        let layout = fx.tmp.path().join("base");
        let digest = write_test_image(&layout);
        fx.store.put("python:3.12", &digest, &layout).await.unwrap();

        let recipe = "FROM python:3.12\nENTRYPOINT [\"/srv/run\"]\n";
        fx.builder().build(fx.config(recipe)).await.unwrap();

        let stored = fx.store.get("app:test").await.unwrap();
        let image = OciImage::from_path(&stored.path).unwrap();
        assert_eq!(image.config().entrypoint, Some(vec!["/srv/run".to_string()]));
        assert!(image.config().cmd.is_none());
    }

    #[tokio::test]
    async fn test_copy_into_missing_file_destination() {
        let fx = Fixture::new();
        let recipe = "FROM scratch\nCOPY requirements.txt /etc/app/reqs.txt\nRUN install\n";
        let result = fx.builder().build(fx.config(recipe)).await.unwrap();
        assert_eq!(result.layer_count, 2);
    }
}
