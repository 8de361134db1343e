use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

/// Error kinds for Lapis operations
///
/// This enum represents all possible error types that can occur during Lapis
/// database operations. Each error kind describes a specific category of
/// failure, enabling precise error handling.
///
/// # Examples
///
/// ```rust,ignore
/// use lapis::errors::{LapisError, ErrorKind, LapisResult};
///
/// fn example() -> LapisResult<()> {
///     Err(LapisError::new("Map not found", ErrorKind::NotFound))
/// }
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    // IO and Storage Errors - used in store read/write paths
    /// Generic IO error
    IoError,
    /// Stored data is corrupted
    Corruption,
    /// Store has already been closed
    StoreAlreadyClosed,

    // Constraint Errors - used when a write violates table invariants
    /// A table constraint was violated
    ConstraintViolation,

    // Resource Errors
    /// Memory could not be allocated
    OutOfMemory,
    /// The requested resource was not found
    NotFound,

    // Validation Errors
    /// A caller-supplied argument is malformed
    InvalidArgument,
    /// The operation is not valid in the current context
    InvalidOperation,

    // Extension Errors - allows external crates to plug in their own error types
    // The String contains the extension name/category (e.g., "spatial")
    /// Error from an extension module
    Extension(String),

    // Generic/Internal Errors - used as fallback
    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::IoError => write!(f, "IO error"),
            ErrorKind::Corruption => write!(f, "Corruption"),
            ErrorKind::StoreAlreadyClosed => write!(f, "Store already closed"),
            ErrorKind::ConstraintViolation => write!(f, "Constraint violation"),
            ErrorKind::OutOfMemory => write!(f, "Out of memory"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::InvalidArgument => write!(f, "Invalid argument"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::Extension(name) => write!(f, "{} error", name),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Custom Lapis error type.
///
/// `LapisError` encapsulates error information including the error message,
/// kind, and optional cause. It supports error chaining and backtraces for
/// debugging.
#[derive(Clone)]
pub struct LapisError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<LapisError>>,
    backtrace: std::sync::Arc<Backtrace>,
}

impl LapisError {
    /// Creates a new `LapisError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        LapisError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: std::sync::Arc::new(Backtrace::new()),
        }
    }

    /// Creates a new `LapisError` with a cause error.
    ///
    /// This creates an error chain where the cause error is preserved for
    /// debugging.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: LapisError) -> Self {
        LapisError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: std::sync::Arc::new(Backtrace::new()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&LapisError> {
        self.cause.as_deref()
    }
}

impl Display for LapisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for LapisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => write!(f, "{}\n{:?}", self.message, self.backtrace),
        }
    }
}

impl Error for LapisError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for Lapis operations.
///
/// `LapisResult<T>` is shorthand for `Result<T, LapisError>`.
/// All fallible Lapis operations return this type.
pub type LapisResult<T> = Result<T, LapisError>;

impl From<std::io::Error> for LapisError {
    fn from(err: std::io::Error) -> Self {
        LapisError::new(&err.to_string(), ErrorKind::IoError)
    }
}
