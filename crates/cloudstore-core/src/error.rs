//! Error types for cloudstore

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the cloudstore Error
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed underlying cause of a backend failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type shared by the store, its backends and object handles
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors
    #[error("Object not found: {name}")]
    NotFound { name: String },

    #[error("Object already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Invalid object key {name:?}: {reason}")]
    InvalidKey { name: String, reason: String },

    // Lifecycle errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    // Local scratch-file errors
    #[error("Local I/O error on {}: {source}", .path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Backend transport errors
    #[error("{backend} backend error: {message}")]
    Remote {
        backend: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    // Cancellation
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn not_found(name: impl Into<String>) -> Self {
        Error::NotFound { name: name.into() }
    }

    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Backend failure without an underlying error value
    pub fn remote(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            backend: backend.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Backend failure preserving the transport error as its source
    pub fn remote_with<E>(backend: impl Into<String>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Remote {
            backend: backend.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if the named entry does not exist
    ///
    /// Lets callers tell "object absent" apart from a transient failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true if this error is retryable
    ///
    /// The store never retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Remote { .. } | Error::Timeout { .. })
    }

    /// Returns true if the operation was aborted by its context
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::Timeout { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::NotFound { .. } => std::io::ErrorKind::NotFound,
            Error::AlreadyExists { .. } => std::io::ErrorKind::AlreadyExists,
            Error::InvalidKey { .. } => std::io::ErrorKind::InvalidInput,
            Error::InvalidState { .. } => std::io::ErrorKind::PermissionDenied,
            Error::Timeout { .. } => std::io::ErrorKind::TimedOut,
            Error::Cancelled { .. } => std::io::ErrorKind::Interrupted,
            Error::LocalIo { source, .. } => source.kind(),
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        let err = Error::not_found("prefix/test.csv");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Object not found: prefix/test.csv");
    }

    #[test]
    fn test_error_retryable() {
        let err = Error::remote("s3", "connection reset");
        assert!(err.is_retryable());

        let err = Error::AlreadyExists {
            name: "test.csv".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_remote_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::remote_with("s3", "get_object failed", io);

        let source = std::error::Error::source(&err).expect("source should be preserved");
        assert_eq!(source.to_string(), "reset by peer");
    }

    #[test]
    fn test_into_io_error_kind() {
        let io: std::io::Error = Error::InvalidState {
            message: "handle is read-only".to_string(),
        }
        .into();
        assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);

        let io: std::io::Error = Error::not_found("missing").into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
