//! Error types for unbundle
//!
//! Uses `thiserror` for the library error taxonomy. Every failure mode the
//! deployment engine can surface maps to exactly one variant; per-candidate
//! root errors are retained across fallback attempts and only raised when
//! every root has failed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for unbundle operations
pub type DeployResult<T> = Result<T, DeployError>;

/// Main error type for unbundle operations
#[derive(Error, Debug)]
pub enum DeployError {
    /// Unresolved or malformed `$(...)` placeholder, bad name tag, or a
    /// forbidden character in an expanded template
    #[error("template error: {message}")]
    TemplateSyntax { message: String },

    /// Zero entries matched the source template
    #[error("no resources found at '{path}'")]
    ResourceNotFound { path: String },

    /// Source length or decompressed length does not fit the deployable range
    #[error("resource '{name}' is invalid: {message}")]
    ResourceInvalid { name: String, message: String },

    /// Read, write, create, or decompress failure during deployment
    #[error("deployment I/O failure at {path}: {source}")]
    DeployIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not take the directory lock within the retry window while a
    /// peer's liveness beacon stayed fresh
    #[error(
        "unable to take the directory lock at {path} \
         (timeout: {timeout_ms} ms, elapsed: {elapsed_ms} ms, lock age: {age_ms} ms)"
    )]
    DeployLocked {
        path: PathBuf,
        timeout_ms: u64,
        elapsed_ms: u64,
        age_ms: i64,
    },

    /// The platform dynamic loader rejected a library even after the
    /// fixed-point retry sweep
    #[error("failed to load dynamic library {path}: {message}")]
    LibraryLoad { path: PathBuf, message: String },

    /// Incompatible or incomplete builder options
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl DeployError {
    /// Template-syntax error from a formatted message
    pub(crate) fn template(message: impl Into<String>) -> Self {
        DeployError::TemplateSyntax {
            message: message.into(),
        }
    }

    /// I/O error bound to the path it happened at
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DeployError::DeployIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        DeployError::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_error_reports_timings() {
        let err = DeployError::DeployLocked {
            path: PathBuf::from("/tmp/deploy"),
            timeout_ms: 4000,
            elapsed_ms: 12345,
            age_ms: -7,
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/deploy"));
        assert!(msg.contains("timeout: 4000 ms"));
        assert!(msg.contains("lock age: -7 ms"));
    }

    #[test]
    fn io_error_keeps_source() {
        let err = DeployError::io("/x/y", io::Error::new(io::ErrorKind::Other, "disk on fire"));
        let msg = err.to_string();
        assert!(msg.contains("/x/y"));
        assert!(msg.contains("disk on fire"));
    }

    #[test]
    fn template_error_display() {
        let err = DeployError::template("unknown key at position 3: $(NOPE)");
        assert!(err.to_string().starts_with("template error:"));
    }
}
