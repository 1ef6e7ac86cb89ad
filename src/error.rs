//! Error types for archstage.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::LayerName;

/// Result type for archstage operations.
pub type Result<T> = std::result::Result<T, ArchError>;

/// Errors that can occur while working with a model or its changesets.
#[derive(Error, Debug)]
pub enum ArchError {
    // File Errors
    #[error("Failed to read file: {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}: {source}")]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory creation failed: {path}: {source}")]
    DirectoryCreateError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Serialization Errors
    #[error("JSON serialization error: {0}")]
    JsonSerializationError(#[from] serde_json::Error),

    #[error("Invalid manifest schema version: {version}")]
    InvalidSchemaVersion { version: String },

    #[error("Migration failed from {from} to {to}: {reason}")]
    MigrationError {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid configuration in {path}: {reason}")]
    ConfigError { path: PathBuf, reason: String },

    // Model Errors
    #[error("Model already exists: {path}")]
    ModelAlreadyExists { path: PathBuf },

    #[error("Model not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("Failed to load model file {path}: {source}")]
    ModelLoadFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown layer: {name}")]
    UnknownLayer { name: String },

    #[error("Layer not found in model: {layer}")]
    LayerNotFound { layer: LayerName },

    #[error("Element '{id}' not found in layer {layer}")]
    ElementNotFound { layer: LayerName, id: String },

    #[error("Element '{id}' already exists in layer {layer}")]
    ElementExists { layer: LayerName, id: String },

    // Changeset Errors
    #[error("Changeset already exists: {id}")]
    ChangesetExists { id: String },

    #[error("Changeset not found: {id}")]
    ChangesetNotFound { id: String },

    #[error("No changeset given and no changeset is active")]
    NoActiveChangeset,

    #[error("Failed to load changeset '{id}' from {path}: {source}")]
    ChangesetLoadFailed {
        id: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid changeset id: '{id}'")]
    InvalidChangesetId { id: String },

    #[error("Changeset '{id}' is {status}, expected {expected}")]
    InvalidChangesetStatus {
        id: String,
        status: String,
        expected: String,
    },

    #[error(
        "Replay of changeset '{changeset_id}' failed: update #{sequence_number} targets \
         missing element '{element_id}' in layer {layer}"
    )]
    ReplayTargetMissing {
        changeset_id: String,
        layer: LayerName,
        element_id: String,
        sequence_number: u64,
    },

    #[error("Changeset '{id}' is incompatible with the current model: {}", reasons.join("; "))]
    IncompatibleChangeset { id: String, reasons: Vec<String> },

    // Lock Errors
    #[error("Timed out after {timeout_ms} ms waiting for lock: {path}")]
    LockTimeout { path: PathBuf, timeout_ms: u128 },

    #[error("Failed to acquire lock: {path}: {source}")]
    LockAcquireFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to release lock: {path}: {source}")]
    LockReleaseFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic Errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchError {
    /// Returns true if this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArchError::LockTimeout { .. } | ArchError::FileWriteError { .. }
        )
    }

    /// Returns true for the "something is missing" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArchError::ModelNotFound { .. }
                | ArchError::LayerNotFound { .. }
                | ArchError::ElementNotFound { .. }
                | ArchError::ChangesetNotFound { .. }
        )
    }

    /// Returns a user-friendly recovery suggestion.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            ArchError::ModelNotFound { .. } => Some(
                "Run 'archstage --model <dir> init' or point --model at an existing model.",
            ),
            ArchError::LockTimeout { .. } => Some(
                "Another archstage process may be running. If it crashed, run 'archstage lock cleanup'.",
            ),
            ArchError::LockReleaseFailed { .. } => {
                Some("Remove the .lock file manually once no other process is running.")
            }
            ArchError::ChangesetNotFound { .. } => {
                Some("Run 'archstage changeset list' to see available changesets.")
            }
            ArchError::NoActiveChangeset => {
                Some("Pass a changeset id or run 'archstage changeset stage <id>'.")
            }
            ArchError::IncompatibleChangeset { .. } => {
                Some("Inspect the changeset with 'changeset diff' or retry with --force.")
            }
            ArchError::ReplayTargetMissing { .. } => {
                Some("Unstage the offending element with 'changeset unstage'.")
            }
            ArchError::ChangesetLoadFailed { .. } | ArchError::ModelLoadFailed { .. } => {
                Some("The file is corrupted; restore it from version control.")
            }
            _ => None,
        }
    }
}
