//! Error types for the checkpoint persistence engine

use thiserror::Error;

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tree-of-arrays checkpointing
#[derive(Error, Debug)]
pub enum Error {
    // Geometry and configuration errors
    #[error("Invalid chunk geometry for leaf '{leaf}': {reason}")]
    InvalidChunkGeometry { leaf: String, reason: String },

    #[error("Geometry mismatch for leaf '{leaf}': region {region} inconsistent with shape {shape}")]
    GeometryMismatch {
        leaf: String,
        region: String,
        shape: String,
    },

    #[error("Invalid sharding for leaf '{leaf}': {reason}")]
    InvalidSharding { leaf: String, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Checkpoint errors
    #[error("Incomplete checkpoint at {path}: finalize marker missing")]
    IncompleteCheckpoint { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Leaf not found: {leaf}")]
    LeafNotFound { leaf: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage backend unavailable at {path}: {reason}")]
    StorageUnavailable { path: String, reason: String },

    // Coordination errors
    #[error("Barrier failed: {tag} - {reason}")]
    Barrier { tag: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Task errors
    #[error("Task join error: {message}")]
    TaskJoin { message: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. }
                | Error::StorageUnavailable { .. }
                | Error::Io(_)
                | Error::Barrier { .. }
        )
    }

    /// Returns true if this error was caused by invalid caller configuration
    /// rather than by the state of the storage backend
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidChunkGeometry { .. }
                | Error::InvalidSharding { .. }
                | Error::InvalidConfig { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::StorageUnavailable {
            path: "/tmp/ckpt".to_string(),
            reason: "permission denied".to_string(),
        };
        assert!(err.is_retryable());

        let err = Error::InvalidChunkGeometry {
            leaf: "x".to_string(),
            reason: "rank mismatch".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_config() {
        let err = Error::InvalidChunkGeometry {
            leaf: "x".to_string(),
            reason: "write chunk not a multiple of read chunk".to_string(),
        };
        assert!(err.is_config_error());

        let err = Error::IncompleteCheckpoint {
            path: "/tmp/ckpt".to_string(),
        };
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_error_display_names_leaf() {
        let err = Error::GeometryMismatch {
            leaf: "layers.0.kernel".to_string(),
            region: "[0..12]".to_string(),
            shape: "[10]".to_string(),
        };
        assert!(err.to_string().contains("layers.0.kernel"));
    }
}
