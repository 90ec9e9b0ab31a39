//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate-exceeded signal from the remote platform: wait `seconds`
    /// before retrying `operation`.
    #[error("Flood wait: retry {operation} after {seconds}s")]
    FloodWait { seconds: u64, operation: String },

    /// Progress document has an unsupported shape or version.
    #[error("Progress format error: {0}")]
    Format(String),

    /// Conversation enumeration failed entirely (aborts the run).
    #[error("Failed to enumerate conversations: {0}")]
    Enumeration(String),

    /// A single conversation failed (isolated, the run continues).
    #[error("Dialog {dialog} failed: {message}")]
    Dialog { dialog: String, message: String },

    /// Remote client call failed for a non-flood reason.
    #[error("Remote client error: {0}")]
    Client(String),

    /// Entity could not be resolved on the remote platform.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Progress file write/rename failure. Resumability is at risk but
    /// the in-memory run may continue.
    #[error("Progress persistence error: {0}")]
    Persistence(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a FloodWait error.
    pub fn flood_wait(seconds: u64, operation: impl Into<String>) -> Self {
        MigrateError::FloodWait {
            seconds,
            operation: operation.into(),
        }
    }

    /// Create a Dialog error.
    pub fn dialog(dialog: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Dialog {
            dialog: dialog.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a rate-exceeded signal.
    pub fn is_flood_wait(&self) -> bool {
        matches!(self, MigrateError::FloodWait { .. })
    }

    /// Signaled wait duration, if this is a rate-exceeded signal.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            MigrateError::FloodWait { seconds, .. } => Some(*seconds),
            _ => None,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Process exit code for the CLI layer.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Format(_) => 3,
            MigrateError::Enumeration(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
