//! Error types for fieldsync record handling.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while turning a source payload into an envelope.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed, but is not shaped like an envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn test_invalid_envelope_display() {
        let err = Error::InvalidEnvelope("expected a JSON object".to_string());
        let msg = err.to_string();
        assert!(msg.contains("invalid envelope"));
        assert!(msg.contains("expected a JSON object"));
    }
}
