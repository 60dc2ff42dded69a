//! Error types for semisparse-cli

use semisparse::distributed::CommError;
use semisparse::SparseError;
use std::process::ExitCode;
use thiserror::Error;

/// Result type alias for CLI operations
pub(crate) type Result<T> = std::result::Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug)]
pub(crate) enum CliError {
    /// Bad flag value or configuration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint files missing, malformed, or inconsistent
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A round-trip or correctness check failed
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Collective failure between worker ranks
    #[error("Communication error: {0}")]
    Communication(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other library error
    #[error("Semisparse error: {0}")]
    Semisparse(String),
}

impl CliError {
    /// Get exit code for this error
    pub(crate) fn exit_code(&self) -> ExitCode {
        match self {
            Self::Semisparse(_) => ExitCode::from(1),
            Self::InvalidArgument(_) => ExitCode::from(2),
            Self::Checkpoint(_) => ExitCode::from(4),
            Self::ValidationFailed(_) => ExitCode::from(5),
            Self::Communication(_) => ExitCode::from(6),
            Self::Io(_) => ExitCode::from(7),
        }
    }
}

impl From<SparseError> for CliError {
    fn from(e: SparseError) -> Self {
        match e {
            SparseError::InvalidConfig { .. } => Self::InvalidArgument(e.to_string()),
            SparseError::Comm(CommError::InvalidWorld(_)) => Self::InvalidArgument(e.to_string()),
            SparseError::Comm(_) => Self::Communication(e.to_string()),
            SparseError::Checkpoint(_) | SparseError::CheckpointFileNotFound(_) => {
                Self::Checkpoint(e.to_string())
            }
            SparseError::AssertionFailed(_) => Self::ValidationFailed(e.to_string()),
            SparseError::Io(io) => Self::Io(io),
            other => Self::Semisparse(other.to_string()),
        }
    }
}
