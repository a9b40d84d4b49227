//! Error types for the reconciliation engine.
//!
//! Only some of these are fatal. [`Error::Transport`] and [`Error::Parse`]
//! are contained below the store boundary; [`Error::CorruptState`],
//! [`Error::Persist`] and [`Error::Subscription`] stop ingestion.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope handling error from the core crate.
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The historical collaborator could not be reached or answered badly.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single line or message could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The record file exists but cannot be read as a record array.
    #[error("corrupt state file {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    /// The record file could not be rewritten.
    #[error("failed to persist {}: {reason}", path.display())]
    Persist { path: PathBuf, reason: String },

    /// The live channel rejected us or dropped the connection.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether ingestion must stop when this error reaches the loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Parse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_state_display() {
        let err = Error::CorruptState {
            path: PathBuf::from("/data/hybrid_data.json"),
            reason: "expected value at line 1 column 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("corrupt state file"));
        assert!(msg.contains("/data/hybrid_data.json"));
        assert!(msg.contains("line 1 column 1"));
    }

    #[test]
    fn test_fatality() {
        assert!(!Error::Transport("timed out".to_string()).is_fatal());
        assert!(!Error::Parse("bad line".to_string()).is_fatal());
        assert!(Error::Subscription("refused".to_string()).is_fatal());
        assert!(
            Error::Persist {
                path: PathBuf::from("x"),
                reason: "disk full".to_string()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
