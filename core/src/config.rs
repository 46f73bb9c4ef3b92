use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StratumError};

/// Environment variable overriding the Stratum home directory.
pub const HOME_ENV: &str = "STRATUM_HOME";

/// Stratum configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    /// Home directory holding images/, cache/ and config.yaml
    pub home: PathBuf,

    /// Maximum total size of the image store (accepts "10g", "512m", ...)
    #[serde(deserialize_with = "deserialize_size")]
    pub store_max_bytes: u64,

    /// Maximum total size of the layer cache
    #[serde(deserialize_with = "deserialize_size")]
    pub cache_max_bytes: u64,

    /// How RUN steps are executed
    pub executor: ExecutorKind,

    /// Never contact a registry; base images must already be in the store
    pub offline: bool,

    /// Logging configuration
    pub log: LogConfig,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            store_max_bytes: 10 * 1024 * 1024 * 1024,
            cache_max_bytes: 5 * 1024 * 1024 * 1024,
            executor: ExecutorKind::default(),
            offline: false,
            log: LogConfig::default(),
        }
    }
}

impl StratumConfig {
    /// Load configuration from `<home>/config.yaml`.
    ///
    /// The home directory comes from `STRATUM_HOME`, falling back to
    /// `~/.stratum`. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let home = resolve_home(std::env::var_os(HOME_ENV));
        let mut config = Self::from_file(&home.join("config.yaml"))?;
        config.home = home;
        Ok(config)
    }

    /// Load configuration from a specific YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| StratumError::Config(e.to_string()))
    }

    /// Image store directory.
    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    /// Layer cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache").join("layers")
    }
}

/// Home directory from the `STRATUM_HOME` value. Empty counts as unset.
fn resolve_home(value: Option<std::ffi::OsString>) -> PathBuf {
    match value {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => default_home(),
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".stratum"))
        .unwrap_or_else(|| PathBuf::from(".stratum"))
}

/// RUN step executor selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// chroot into the image rootfs (Linux, requires privileges)
    Chroot,
    /// Run on the host with the working directory inside the rootfs
    Host,
}

impl Default for ExecutorKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Chroot
        } else {
            Self::Host
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chroot" => Ok(Self::Chroot),
            "host" => Ok(Self::Host),
            _ => Err(format!("unknown executor: '{}' (supported: chroot, host)", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            format: LogFormat::Text,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string for an env filter.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Parse a human-readable size string (e.g., "10g", "512m", "4096") into bytes.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (num, mult) = if let Some(n) = s.strip_suffix("gb").or_else(|| s.strip_suffix('g')) {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("mb").or_else(|| s.strip_suffix('m')) {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix("kb").or_else(|| s.strip_suffix('k')) {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1u64)
    } else {
        return Err(format!("unrecognized size format: {s}"));
    };
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num}"))?;
    Ok(n * mult)
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
