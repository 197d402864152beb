//! Error types for the WatchedSky data model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or converting alerts and features.
#[derive(Error, Debug)]
pub enum Error {
    /// A content identifier could not be parsed.
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    /// A required property is absent.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A property has the wrong shape (e.g., a number where a string belongs).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A timestamp is not valid RFC 3339.
    #[error("invalid timestamp '{value}': {source}")]
    Timestamp {
        /// The raw value that failed to parse.
        value: String,
        /// The underlying parse failure.
        source: chrono::ParseError,
    },

    /// The feature's `@type` discriminator is not `wx:Alert`.
    #[error("feature '{id}' is not an alert (type {found})")]
    NotAnAlert {
        /// Feature identifier.
        id: String,
        /// The discriminator that was found instead.
        found: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
