use std::path::PathBuf;

/// Failures that stop a run. Per-address network and parse failures never
/// surface here; they become [`crate::types::AddressOutcome`] or
/// [`crate::types::ModelStatus`] values instead.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Invalid settings in the run configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The persisted state was produced by a run with different settings.
    #[error(
        "scan configuration changed since the saved state was written ({field} differs); \
         delete {path} or rerun without --resume"
    )]
    FingerprintMismatch { field: &'static str, path: PathBuf },

    /// The state file exists but cannot be decoded.
    #[error("state file {path} is corrupt: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The candidate list was missing. An empty file has been created in its place.
    #[error("input file {0} did not exist; an empty one was created, add one address per line and rerun")]
    MissingInput(PathBuf),

    /// Reading or writing a local file failed.
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The external discovery process is unavailable or failed.
    #[error("discovery tool {tool}: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// The operation was interrupted by the shared cancellation token.
    #[error("cancelled")]
    Cancelled,
}

impl ScanError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ScanError::Persistence {
            context: context.into(),
            source,
        }
    }

    /// True for the configuration-class errors that abort before any scanning.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ScanError::Config(_) | ScanError::FingerprintMismatch { .. } | ScanError::StateCorrupt { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
