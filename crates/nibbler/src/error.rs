//! Error types for the reconciliation library.

use crate::connector::ConnectorError;
use thiserror::Error;

/// Main error type for reconciliation operations.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Configuration error (invalid YAML, missing fields, bad option combination)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A connector could not report its key range. Fatal for the run.
    #[error("Range error from {connector}: {source}")]
    Range {
        connector: String,
        #[source]
        source: ConnectorError,
    },

    /// A connector failed a window operation and retries were exhausted.
    #[error("Window error from {connector}: {source}")]
    Bite {
        connector: String,
        #[source]
        source: ConnectorError,
    },

    /// A connector failed to initialize or restore its session fragment.
    #[error("Lifecycle error from {connector}: {source}")]
    Lifecycle {
        connector: String,
        #[source]
        source: ConnectorError,
    },

    /// Error raised while finishing a run (end-of-walk bookkeeping, destroy)
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// Session store error
    #[error("Session state error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the session was created - cannot resume. Use --restart to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Create a Range error for the named connector
    pub fn range(connector: impl Into<String>, source: ConnectorError) -> Self {
        ReconcileError::Range {
            connector: connector.into(),
            source,
        }
    }

    /// Create a Bite error for the named connector
    pub fn bite(connector: impl Into<String>, source: ConnectorError) -> Self {
        ReconcileError::Bite {
            connector: connector.into(),
            source,
        }
    }

    /// Create a Lifecycle error for the named connector
    pub fn lifecycle(connector: impl Into<String>, source: ConnectorError) -> Self {
        ReconcileError::Lifecycle {
            connector: connector.into(),
            source,
        }
    }

    /// Format error with full details including error chain
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

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReconcileError::Config(_) | ReconcileError::Yaml(_) | ReconcileError::ConfigChanged => 2,
            ReconcileError::Range { .. }
            | ReconcileError::Bite { .. }
            | ReconcileError::Lifecycle { .. } => 3,
            ReconcileError::State(_) | ReconcileError::Json(_) => 4,
            ReconcileError::Io(_) => 5,
            ReconcileError::Terminal(_) => 6,
        }
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
