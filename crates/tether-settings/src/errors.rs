//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why the gateway settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The settings file is not valid JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser error.
        source: serde_json::Error,
    },
    /// The merged tree does not fit the settings schema (wrong field types).
    #[error("settings do not match the schema: {0}")]
    Schema(#[from] serde_json::Error),
    /// A value is out of range or a required value is missing.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
