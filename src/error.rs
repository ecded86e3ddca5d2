//! Error types for siteindex.

use thiserror::Error;

/// Error type for siteindex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid block pattern
    #[error(transparent)]
    Pattern(#[from] PatternCompileError),

    /// Partition could not be loaded
    #[error(transparent)]
    PartitionLoad(#[from] PartitionLoadError),

    /// Usage state could not be persisted
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for siteindex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A pattern source that could not be compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid pattern {source_text:?}: {reason}")]
pub struct PatternCompileError {
    /// Pattern source as written in the catalog
    pub source_text: String,
    /// Compiler message
    pub reason: String,
}

/// Error type for partition fetches.
#[derive(Error, Debug)]
pub enum PartitionLoadError {
    /// Transport failure (file or network)
    #[error("failed to fetch {locator}: {reason}")]
    Fetch { locator: String, reason: String },

    /// Non-success HTTP status
    #[error("HTTP {status} fetching {locator}")]
    Status { locator: String, status: u16 },

    /// Payload digest does not match the manifest
    #[error("checksum mismatch for {locator}")]
    ChecksumMismatch { locator: String },

    /// Payload could not be decoded into entries
    #[error("failed to parse {locator}: {reason}")]
    Parse { locator: String, reason: String },

    /// Retry policy exhausted
    #[error("gave up on {locator} after {attempts} attempts")]
    Exhausted { locator: String, attempts: u32 },
}

/// Error type for the usage store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// IO error
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored state could not be encoded or decoded
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
