//! Error types for frame parsing in agrisense-types.

use thiserror::Error;

/// Errors that can occur when parsing a telemetry frame.
///
/// These never leave the reassembly layer: a frame that fails to parse is
/// dropped and counted, and its siblings in the same stream are unaffected.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The frame bytes were not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// The frame payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(String),

    /// The payload parsed but was not a JSON object.
    #[error("frame payload is not a JSON object")]
    NotAnObject,

    /// The object carried no numeric telemetry fields.
    #[error("frame carries no numeric fields")]
    NoNumericFields,
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json(err.to_string())
    }
}

/// Result type alias using agrisense-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
