//! Error types for node-local log operations.

use std::path::PathBuf;

use kubetail_k8s::PermissionError;
use thiserror::Error;

/// Errors that can occur while indexing, watching or streaming log files.
#[derive(Debug, Error)]
pub enum LogError {
    /// The caller supplied no namespaces.
    #[error("namespaces required")]
    NamespacesRequired,

    /// A file in the log directory does not follow the runtime's naming scheme.
    #[error("malformed log file name: {0}")]
    MalformedFileName(String),

    /// No log file exists for the requested container.
    #[error("log file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The grep filter is not a valid regular expression.
    #[error("invalid grep pattern: {0}")]
    InvalidGrep(#[from] regex::Error),

    /// The caller is not allowed to read these logs.
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// The line-processing engine could not be started.
    #[error("failed to start log engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem watcher failed.
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogError {
    /// Whether the request itself was invalid and should not be retried
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::NamespacesRequired
                | Self::MalformedFileName(_)
                | Self::NotFound(_)
                | Self::InvalidGrep(_)
        )
    }
}

/// Result type alias for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_path() {
        let err = LogError::NotFound(PathBuf::from("/var/log/containers/p_ns_c-1.log"));
        assert_eq!(
            err.to_string(),
            "log file not found: /var/log/containers/p_ns_c-1.log"
        );
        assert!(err.is_input_error());
    }

    #[test]
    fn permission_error_is_transparent() {
        let err: LogError = PermissionError::NamespacesRequired.into();
        assert_eq!(err.to_string(), "namespaces required");
        assert!(!err.is_input_error());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogError>();
    }
}
