//! Error types for critical-period training.

use thiserror::Error;

/// Main error type shared by every crate in the workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset error (missing files, malformed records)
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Dataset download error
    #[error("Download error: {0}")]
    Download(String),

    /// A transform received input it cannot handle
    #[error("Transform error: {0}")]
    Transform(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint save/load error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Logging setup error
    #[error("Logging error: {0}")]
    Logging(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for critical-period operations.
pub type Result<T> = std::result::Result<T, Error>;
