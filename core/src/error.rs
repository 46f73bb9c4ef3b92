use thiserror::Error;

/// Stratum error types
#[derive(Error, Debug)]
pub enum StratumError {
    /// Base image could not be resolved
    #[error("Base image resolution failed: {reference} - {message}")]
    Resolution { reference: String, message: String },

    /// A RUN step (dependency installation) returned a non-success outcome
    #[error("Step failed ({}): {command}: {stderr}", exit_label(.exit_code))]
    Install {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Copy, read or write failure while staging files
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// Malformed build recipe
    #[error("Recipe error at line {line}: {message}")]
    Recipe { line: usize, message: String },

    /// Layer cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImage(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit {code}"),
        None => "not started".to_string(),
    }
}

impl StratumError {
    /// Build a recipe error for the given 1-based line.
    pub fn recipe(line: usize, message: impl Into<String>) -> Self {
        StratumError::Recipe {
            line,
            message: message.into(),
        }
    }

    /// Build a resolution error for a base image reference.
    pub fn resolution(reference: impl Into<String>, message: impl Into<String>) -> Self {
        StratumError::Resolution {
            reference: reference.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        StratumError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StratumError {
    fn from(err: serde_yaml::Error) -> Self {
        StratumError::Serialization(err.to_string())
    }
}

/// Result type alias for Stratum operations
pub type Result<T> = std::result::Result<T, StratumError>;
