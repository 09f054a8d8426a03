//! Error types for kbsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from store and settings operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, with the path that was being touched.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error (file records).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error on load: includes the offending file path.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.kbsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// No configuration record exists under the given id.
    #[error("configuration '{id}' not found at {path}")]
    ConfigNotFound { id: String, path: PathBuf },

    /// Configuration ids become file names; separators and `..` are refused.
    #[error("invalid configuration id '{0}'")]
    InvalidConfigId(String),

    /// Settings were loaded but are not usable.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
