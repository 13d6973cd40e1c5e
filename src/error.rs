//! Error types for the copula imputer.

use ndarray::ShapeError;
use thiserror::Error;

/// Result type alias for imputer operations.
pub type Result<T> = std::result::Result<T, ImputerError>;

/// Errors that can occur while configuring, training, or querying the imputer.
#[derive(Error, Debug)]
pub enum ImputerError {
    /// Invalid parameter value supplied by the caller.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),
    /// Shape mismatch in arrays.
    #[error("Shape mismatch: expected {expected_shape}, got {actual_shape}")]
    ShapeMismatch {
        expected_shape: String,
        actual_shape: String,
    },
    /// A cluster, variable, or atom index outside its valid range.
    #[error("{what} index {index} out of range (limit {limit})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },
    /// A matrix that must be symmetric positive definite is not.
    #[error("Matrix is not symmetric positive definite: {0}")]
    NotPositiveDefinite(String),
    /// A posterior draw produced an unusable value. Fatal for the current sweep.
    #[error("Numerical error: {0}")]
    Numerical(String),
    /// The worker pool could not be built.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
    /// An IO error.
    #[error("IO error: {0}")]
    IoError(String),
    /// A serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ImputerError {
    pub(crate) fn shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        ImputerError::ShapeMismatch {
            expected_shape: expected.into(),
            actual_shape: actual.into(),
        }
    }
}

impl From<ShapeError> for ImputerError {
    fn from(err: ShapeError) -> Self {
        ImputerError::ShapeMismatch {
            expected_shape: "unknown".to_string(),
            actual_shape: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ImputerError {
    fn from(err: std::io::Error) -> Self {
        ImputerError::IoError(err.to_string())
    }
}

impl From<bincode::Error> for ImputerError {
    fn from(err: bincode::Error) -> Self {
        ImputerError::SerializationError(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for ImputerError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        ImputerError::WorkerPool(err.to_string())
    }
}
