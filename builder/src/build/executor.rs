//! RUN step execution.
//!
//! The engine hands each RUN command to a [`StepExecutor`]. Whatever the
//! command does (installing dependencies, compiling, ...) is opaque to the
//! engine: it only observes the exit status and the filesystem afterwards.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stratum_core::error::{Result, StratumError};

/// Default PATH inside the image when the image does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Maximum bytes of stderr carried in an install error.
const STDERR_TAIL_BYTES: usize = 4096;

/// A single RUN invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Shell command
    pub command: String,
    /// Host path of the image rootfs being built
    pub rootfs: PathBuf,
    /// Absolute working directory inside the image
    pub workdir: String,
    /// Image environment
    pub env: Vec<(String, String)>,
    /// Image user, if set
    pub user: Option<String>,
}

impl RunRequest {
    /// Host path of the working directory.
    pub fn host_workdir(&self) -> PathBuf {
        self.rootfs.join(self.workdir.trim_start_matches('/'))
    }
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs RUN commands against a rootfs.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run one command to completion.
    ///
    /// A non-zero exit must be reported as `StratumError::Install`.
    async fn run(&self, request: &RunRequest) -> Result<RunOutput>;
}

/// Executes commands chrooted into the rootfs (Linux, requires root).
#[derive(Debug, Default, Clone)]
pub struct ChrootExecutor;

impl ChrootExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepExecutor for ChrootExecutor {
    fn name(&self) -> &str {
        "chroot"
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutput> {
        if !cfg!(target_os = "linux") {
            return Err(not_started(
                request,
                "chroot execution is only available on Linux; use the host executor",
            ));
        }
        // SAFETY: geteuid has no preconditions
        if unsafe { libc::geteuid() } != 0 {
            return Err(not_started(request, "chroot execution requires root privileges"));
        }
        if !has_shell(&request.rootfs) {
            return Err(not_started(request, "image has no /bin/sh"));
        }

        let script = format!("cd {} && {}", shell_quote(&request.workdir), request.command);

        let mut cmd = tokio::process::Command::new("chroot");
        if let Some(ref user) = request.user {
            cmd.arg(format!("--userspec={}", user));
        }
        cmd.arg(&request.rootfs).arg("/bin/sh").arg("-c").arg(&script);

        cmd.env_clear();
        cmd.env("HOME", "/root");
        if !request.env.iter().any(|(k, _)| k == "PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        execute(cmd, request).await
    }
}

/// Executes commands on the host with the working directory inside the
/// rootfs. `STRATUM_ROOTFS` points at the rootfs root.
#[derive(Debug, Default, Clone)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepExecutor for HostExecutor {
    fn name(&self) -> &str {
        "host"
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutput> {
        let workdir = request.host_workdir();
        if !workdir.is_dir() {
            return Err(not_started(
                request,
                &format!("working directory {} does not exist", request.workdir),
            ));
        }

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&request.command);
        cmd.current_dir(&workdir);
        for (key, value) in &request.env {
            // The image PATH refers to paths inside the rootfs
            if key != "PATH" {
                cmd.env(key, value);
            }
        }
        cmd.env("STRATUM_ROOTFS", &request.rootfs);

        execute(cmd, request).await
    }
}

async fn execute(mut cmd: tokio::process::Command, request: &RunRequest) -> Result<RunOutput> {
    cmd.stdin(std::process::Stdio::null());
    tracing::debug!(command = %request.command, workdir = %request.workdir, "Executing RUN step");

    let output = cmd
        .output()
        .await
        .map_err(|e| not_started(request, &e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(StratumError::Install {
            command: request.command.clone(),
            exit_code: output.status.code(),
            stderr: tail(stderr.trim(), STDERR_TAIL_BYTES).to_string(),
        });
    }

    Ok(RunOutput { stdout, stderr })
}

fn not_started(request: &RunRequest, reason: &str) -> StratumError {
    StratumError::Install {
        command: request.command.clone(),
        exit_code: None,
        stderr: reason.to_string(),
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Quote a string for POSIX sh.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Whether a rootfs provides `/bin/sh`.
fn has_shell(rootfs: &Path) -> bool {
    rootfs.join("bin/sh").exists()
}
