//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A data stream label that is not `<message-id>:<channel-id>`
    #[error("Invalid channel label: {0:?}")]
    InvalidLabel(String),

    /// A control channel message that is neither a reply nor a known request
    #[error("Unexpected control message: {0}")]
    UnexpectedMessage(String),

    /// A marker body that is not an integer
    #[error("Invalid marker: {0}")]
    InvalidMarker(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 error
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Decoded bytes were not UTF-8
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
