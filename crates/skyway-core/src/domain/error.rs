//! Domain-level error taxonomy for skyway.

use skyway_state::StorageError;

/// Errors produced by event payload validation. No state changes when one
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{kind} payload missing required field: {field}")]
    MissingField { kind: String, field: String },

    #[error("{kind} {id} references unknown {reference_kind} {reference_id}")]
    UnknownReference {
        kind: String,
        id: String,
        reference_kind: String,
        reference_id: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: String, id: String },

    #[error("{kind} {id} is invalid: {reason}")]
    Invalid {
        kind: String,
        id: String,
        reason: String,
    },
}

impl ValidationError {
    pub fn missing(kind: impl ToString, field: &str) -> Self {
        Self::MissingField {
            kind: kind.to_string(),
            field: field.to_string(),
        }
    }

    pub fn unknown(
        kind: impl ToString,
        id: &str,
        reference_kind: impl ToString,
        reference_id: &str,
    ) -> Self {
        Self::UnknownReference {
            kind: kind.to_string(),
            id: id.to_string(),
            reference_kind: reference_kind.to_string(),
            reference_id: reference_id.to_string(),
        }
    }

    pub fn not_found(kind: impl ToString, id: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid(kind: impl ToString, id: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            kind: kind.to_string(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Skyway engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("selector compile error: {0}")]
    SelectorCompile(String),

    #[error("policy {policy_id} misconfigured: {reason}")]
    PolicyEval { policy_id: String, reason: String },

    #[error("illegal job transition for {job_id}: {from} -> {to}")]
    JobState {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("workspace snapshot not found: {path}")]
    SnapshotNotFound { path: String },

    #[error("workspace snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("snapshot codec error: {0}")]
    Codec(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for skyway engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
