//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while polling, publishing or reconciling.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status from an upstream endpoint.
    #[error("{endpoint} returned HTTP {status}: {message}")]
    Status {
        /// The endpoint that was called.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        message: String,
    },

    /// Structured XRPC error returned by the ledger.
    #[error("XRPC {method} failed: {error}: {message}")]
    Xrpc {
        /// The XRPC method (NSID).
        method: String,
        /// Machine-readable error name (e.g., `ExpiredToken`).
        error: String,
        /// Human-readable message.
        message: String,
    },

    /// Websocket error on the commit stream.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The commit stream ended.
    #[error("commit stream closed")]
    StreamClosed,

    /// Document store error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR parsing error.
    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),

    /// Malformed frame, CAR file, tree node or feed entry.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Data model error (geometry, timestamps, CIDs).
    #[error(transparent)]
    Core(#[from] watchedsky_core::Error),

    /// A record or feature that should be an alert is something else.
    #[error("not an alert: {0}")]
    NotAnAlert(String),

    /// A commit tree entry or block disagrees with the CID declared for it.
    #[error("integrity violation at {path}: commit does not match declared CID {declared}")]
    Integrity {
        /// Repository path of the record.
        path: String,
        /// The CID declared by the commit.
        declared: String,
    },

    /// The operation needs an authenticated ledger session.
    #[error("operation requires an authenticated ledger session")]
    AuthRequired,

    /// Internal invariant broken. Indicates a bug.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification used for propagation policy and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Feed, ledger or store unreachable or non-success status.
    Transport,
    /// Malformed JSON, record or geometry; drops a single record or event.
    Decode,
    /// Content-identifier mismatch on a ledger commit.
    Integrity,
    /// No valid ledger session.
    AuthenticationRequired,
    /// Programming-level invariant.
    StateInvariant,
    /// Bad configuration.
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Integrity => "integrity",
            Self::AuthenticationRequired => "auth_required",
            Self::StateInvariant => "state_invariant",
            Self::Configuration => "configuration",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_)
            | Self::Status { .. }
            | Self::Xrpc { .. }
            | Self::WebSocket(_)
            | Self::StreamClosed
            | Self::Database(_)
            | Self::Io(_) => ErrorKind::Transport,
            Self::Json(_) | Self::Cbor(_) | Self::Decode(_) | Self::Core(_) | Self::NotAnAlert(_) => {
                ErrorKind::Decode
            }
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::AuthRequired => ErrorKind::AuthenticationRequired,
            Self::Invariant(_) => ErrorKind::StateInvariant,
            Self::Config(_) => ErrorKind::Configuration,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}
