//! error types for the repository layer.

use thiserror::Error;

/// errors that can occur in repository operations.
#[derive(Debug, Error)]
pub enum Error {
    /// the database could not be reached or opened.
    #[error("database connection error: {0}")]
    Connection(String),

    /// a migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// a query failed.
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// a stored or supplied value was structurally invalid.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// a referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}
