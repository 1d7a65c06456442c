//! Error types for skyway-state

use thiserror::Error;

/// Errors that can occur in the object-store layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No object stored under the path
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// Path is empty, absolute, or escapes the store root
    #[error("invalid object path: {path}")]
    InvalidPath { path: String },

    /// Digest string is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Filesystem failure
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other backend failure (task join errors, remote drivers)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether this error means the object simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_classified() {
        let err = StorageError::NotFound {
            path: "workspaces/a.snapshot".to_string(),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("workspaces/a.snapshot"));

        let err = StorageError::Backend("boom".to_string());
        assert!(!err.is_not_found());
    }
}
