//! error types shared by the domain layer.

use thiserror::Error;

/// errors that can occur constructing or validating domain types.
#[derive(Debug, Error)]
pub enum Error {
    /// a value failed structural validation.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// a key string was malformed (bad prefix or hex).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// a registration id was malformed.
    #[error("invalid registration id: {0}")]
    InvalidRegistrationId(String),
}
