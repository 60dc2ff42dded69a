//! Error types for semisparse operations.
//!
//! Every fallible operation in the crate returns [`Result`]. There is no
//! retry and no partial-result reporting: the first error aborts the
//! benchmark run or the checkpoint round trip that hit it.

use std::path::PathBuf;
use thiserror::Error;

use crate::distributed::CommError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SparseError>;

/// Main error type for semisparse operations.
///
/// # Examples
///
/// ```
/// use semisparse::error::SparseError;
///
/// let err = SparseError::Unsupported {
///     op: "aten.add".to_string(),
///     reason: "not in the semi-structured dispatch table".to_string(),
/// };
/// assert!(err.to_string().contains("aten.add"));
/// ```
#[derive(Error, Debug)]
pub enum SparseError {
    /// An operation reached the semi-structured dispatch table without a
    /// matching entry, or with operands in an unsupported orientation.
    #[error("Unsupported operation {op}: {reason}")]
    Unsupported {
        /// Operation name
        op: String,
        /// Why the dispatch table rejected it
        reason: String,
    },

    /// The dtype is not accepted by the requested operation.
    #[error("Unsupported dtype {dtype} for {context}")]
    UnsupportedDtype {
        /// Offending dtype label
        dtype: String,
        /// Operation or constructor that rejected it
        context: String,
    },

    /// The operation needs a device the tensor does not live on.
    #[error("Device {found} not supported for {context}, expected {expected}")]
    DeviceUnsupported {
        /// Device the tensor lives on
        found: String,
        /// Device required
        expected: String,
        /// Operation or constructor that rejected it
        context: String,
    },

    /// Operand shapes are incompatible.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Operation that detected the mismatch
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// A group of four elements holds more than two nonzeros.
    #[error("Tensor is not 2:4 sparse: row {row}, group {group} has {nonzeros} nonzeros")]
    NotTwoFourSparse {
        /// Row index
        row: usize,
        /// Group index within the row
        group: usize,
        /// Nonzeros found in the group
        nonzeros: usize,
    },

    /// Invalid sparsity pattern or mask configuration.
    #[error("Invalid sparsity pattern: {message}")]
    InvalidPattern {
        /// Description of the violation
        message: String,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {param} = {value}, expected {constraint}")]
    InvalidConfig {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// Collective communication failed.
    #[error("Collective communication failed: {0}")]
    Comm(#[from] CommError),

    /// Checkpoint planning, storage, or validation failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint file missing on disk.
    #[error("Checkpoint file not found: {0}")]
    CheckpointFileNotFound(PathBuf),

    /// Numerical check failed (equality or closeness assertion).
    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SparseError {
    /// Shorthand for a closed-table dispatch miss.
    pub fn unsupported(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            op: op.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a shape mismatch.
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
