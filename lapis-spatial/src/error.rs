//! Error types for the R-tree module.

use lapis::errors::{ErrorKind, LapisError};
use thiserror::Error;

/// Errors that can occur in R-tree index operations
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("r-tree structure is corrupt: {0}")]
    Corrupt(String),

    #[error("constraint failed: {0}")]
    Constraint(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("geometry predicate failed: {0}")]
    Predicate(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for R-tree operations
pub type SpatialResult<T> = Result<T, SpatialError>;

impl From<SpatialError> for LapisError {
    fn from(err: SpatialError) -> Self {
        match err {
            SpatialError::Io(msg) => LapisError::new(&msg, ErrorKind::IoError),
            SpatialError::Corrupt(msg) => LapisError::new(
                &format!("r-tree structure is corrupt: {}", msg),
                ErrorKind::Corruption,
            ),
            SpatialError::Constraint(msg) => LapisError::new(
                &format!("constraint failed: {}", msg),
                ErrorKind::ConstraintViolation,
            ),
            SpatialError::OutOfMemory => LapisError::new("out of memory", ErrorKind::OutOfMemory),
            SpatialError::Predicate(msg) => {
                LapisError::new(&msg, ErrorKind::Extension("spatial".to_string()))
            }
            SpatialError::InvalidArgument(msg) => {
                LapisError::new(&msg, ErrorKind::InvalidArgument)
            }
        }
    }
}

impl From<LapisError> for SpatialError {
    fn from(err: LapisError) -> Self {
        match err.kind() {
            ErrorKind::Corruption => SpatialError::Corrupt(err.message().to_string()),
            ErrorKind::ConstraintViolation => SpatialError::Constraint(err.message().to_string()),
            ErrorKind::OutOfMemory => SpatialError::OutOfMemory,
            ErrorKind::InvalidArgument | ErrorKind::NotFound => {
                SpatialError::InvalidArgument(err.message().to_string())
            }
            _ => SpatialError::Io(err.message().to_string()),
        }
    }
}
