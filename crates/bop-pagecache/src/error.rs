//! Error codes shared across the page cache.
//!
//! Each subsystem defines its own error enum; [`ErrorCode`] classifies those
//! errors for logging and alerting, and [`ErrorWithContext`] carries the code
//! together with a short description of the failing operation.

use std::fmt;
use thiserror::Error;

/// Failure classes surfaced by the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Datafile read, write or sync failed
    IoFailure,
    /// A page image failed checksum or structural validation
    DataCorruption,
    /// Key material could not be fetched or created
    KeyUnavailable,
    /// The data dictionary refused an exclusive metadata lock
    MetadataLockContention,
    /// A page could not be flushed
    FlushFailure,
    /// No free frame or I/O budget was available
    ResourceExhaustion,
    /// Configuration error
    ConfigurationError,
    /// Worker thread panic
    WorkerPanic,
    /// Operation abandoned because the tablespace is stopping or on shutdown
    OperationCancelled,
    /// Unknown or unclassified error
    Unknown,
}

impl ErrorCode {
    /// Returns a stable identifier for this code, suitable for metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoFailure => "io_failure",
            ErrorCode::DataCorruption => "data_corruption",
            ErrorCode::KeyUnavailable => "key_unavailable",
            ErrorCode::MetadataLockContention => "metadata_lock_contention",
            ErrorCode::FlushFailure => "flush_failure",
            ErrorCode::ResourceExhaustion => "resource_exhaustion",
            ErrorCode::ConfigurationError => "configuration_error",
            ErrorCode::WorkerPanic => "worker_panic",
            ErrorCode::OperationCancelled => "operation_cancelled",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Returns a human-readable description of this code.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::IoFailure => "Datafile I/O failed",
            ErrorCode::DataCorruption => "Page corruption detected",
            ErrorCode::KeyUnavailable => "Encryption key unavailable",
            ErrorCode::MetadataLockContention => "Metadata lock contention",
            ErrorCode::FlushFailure => "Page flush failed",
            ErrorCode::ResourceExhaustion => "Resource exhaustion (frames, I/O budget)",
            ErrorCode::ConfigurationError => "Configuration error",
            ErrorCode::WorkerPanic => "Worker thread panic",
            ErrorCode::OperationCancelled => "Operation cancelled or abandoned",
            ErrorCode::Unknown => "Unknown or unclassified error",
        }
    }

    /// Whether a failure of this class leaves the process unable to guarantee
    /// durability.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::IoFailure | ErrorCode::DataCorruption | ErrorCode::FlushFailure
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wraps an error with its classification and a context string.
#[derive(Debug, Error)]
pub struct ErrorWithContext<E> {
    pub code: ErrorCode,
    pub context: String,
    #[source]
    pub source: E,
}

impl<E: fmt::Display> fmt::Display for ErrorWithContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.as_str(),
            self.context,
            self.source
        )
    }
}

/// Extension trait for attaching an [`ErrorCode`] and context to results.
pub trait ResultExt<T, E> {
    fn with_error_context(
        self,
        code: ErrorCode,
        context: impl Into<String>,
    ) -> Result<T, ErrorWithContext<E>>;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn with_error_context(
        self,
        code: ErrorCode,
        context: impl Into<String>,
    ) -> Result<T, ErrorWithContext<E>> {
        self.map_err(|source| ErrorWithContext {
            code,
            context: context.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_as_str() {
        assert_eq!(ErrorCode::IoFailure.as_str(), "io_failure");
        assert_eq!(ErrorCode::KeyUnavailable.as_str(), "key_unavailable");
        assert_eq!(
            ErrorCode::MetadataLockContention.as_str(),
            "metadata_lock_contention"
        );
    }

    #[test]
    fn fatal_classes() {
        assert!(ErrorCode::IoFailure.is_fatal());
        assert!(ErrorCode::DataCorruption.is_fatal());
        assert!(!ErrorCode::KeyUnavailable.is_fatal());
        assert!(!ErrorCode::MetadataLockContention.is_fatal());
    }

    #[test]
    fn error_with_context_display() {
        use std::io;
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let wrapped = ErrorWithContext {
            code: ErrorCode::IoFailure,
            context: "failed to open datafile for space 7".to_string(),
            source: io_err,
        };
        let display = format!("{}", wrapped);
        assert!(display.contains("io_failure"));
        assert!(display.contains("space 7"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn result_ext_with_error_context() {
        use std::io;
        let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"));

        let err = result
            .with_error_context(ErrorCode::FlushFailure, "page write timed out")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FlushFailure);
        assert_eq!(err.context, "page write timed out");
    }
}
