//! Error types for blockmap

use thiserror::Error;

/// Main error type for blockmap operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Geometry mismatch across passes, or a ledger that references a
    /// version or slot that cannot exist.
    #[error("Consistency error: {reason}")]
    Consistency { reason: String },

    /// Structurally invalid map file.
    #[error("Invalid map format: {reason}")]
    Format { reason: String },

    /// Payload contents that disagree with the map.
    #[error("Integrity verification failed: {reason}")]
    IntegrityError { reason: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn consistency(reason: impl Into<String>) -> Self {
        Self::Consistency {
            reason: reason.into(),
        }
    }

    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }
}

/// Result type alias for blockmap operations
pub type Result<T> = std::result::Result<T, Error>;
