use std::time::Duration;

use thiserror::Error;

/// Failure of a single snapshot exporter.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("dump executable not found: {0}")]
    BinaryNotFound(String),

    #[error("I/O error while running exporter: {0}")]
    Io(#[from] std::io::Error),

    #[error("exporter timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("exporter output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("exporter exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },

    #[error("exporter reported errors on stderr: {0}")]
    Stderr(String),

    #[error("exporter produced an empty snapshot")]
    Empty,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failure talking to the object store. The message is the transport's
/// own diagnostic, kept verbatim.
#[derive(Error, Debug, Clone)]
#[error("{operation} failed for '{key}': {message}")]
pub struct StorageError {
    pub operation: &'static str,
    pub key: String,
    pub message: String,
}

impl StorageError {
    pub fn new(operation: &'static str, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation,
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Terminal failure of a backup run.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A backup run is already in progress")]
    RunInProgress,

    #[error("Snapshot failed: native exporter: {native}; logical exporter: {logical}")]
    Dump { native: String, logical: String },

    #[error("Integrity check failed: {}", .errors.join("; "))]
    Integrity { errors: Vec<String> },

    #[error("Upload failed: {0}")]
    Upload(StorageError),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Backup run exceeded {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Backup run aborted: {0}")]
    Aborted(String),
}

impl BackupError {
    /// Machine-readable kind, used in progress state and HTTP payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "configuration",
            BackupError::RunInProgress => "conflict",
            BackupError::Dump { .. } => "dump",
            BackupError::Integrity { .. } => "integrity",
            BackupError::Upload(_) => "upload",
            BackupError::Storage(_) => "storage",
            BackupError::Timeout(_) => "timeout",
            BackupError::Aborted(_) => "aborted",
        }
    }

    /// Extra diagnostic detail surfaced to the triggering caller.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            BackupError::Integrity { errors } => Some(serde_json::json!({ "validationErrors": errors })),
            BackupError::Dump { native, logical } => {
                Some(serde_json::json!({ "native": native, "logical": logical }))
            }
            BackupError::Upload(e) | BackupError::Storage(e) => Some(serde_json::json!({
                "operation": e.operation,
                "key": e.key,
                "message": e.message,
            })),
            _ => None,
        }
    }
}
