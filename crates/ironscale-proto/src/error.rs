//! error types for the protocol layer.

use thiserror::Error;

/// errors that can occur in protocol handling.
#[derive(Debug, Error)]
pub enum Error {
    /// noise protocol failure (handshake, encrypt, decrypt).
    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    /// a message body failed to (de)serialize.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// a framed message violated the wire format.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}
