//! Storage error taxonomy.

use durable_types::TransitionViolation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is busy, retry")]
    Busy,
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("invariant violation: {0}")]
    Invariant(#[from] TransitionViolation),
    #[error("row not found")]
    NotFound,
    #[error("malformed row data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Map a raw `sqlx::Error` into a [`StorageError`], recognizing SQLite's
/// busy/locked and constraint-violation codes so callers can distinguish
/// "retry me" from "this is a real bug."
pub fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code() {
            match code.as_ref() {
                "5" | "6" => return StorageError::Busy, // SQLITE_BUSY / SQLITE_LOCKED
                "2067" | "1555" => {
                    return StorageError::UniqueViolation(db_err.message().to_string());
                }
                _ => {}
            }
        }
        if db_err.is_unique_violation() {
            return StorageError::UniqueViolation(db_err.message().to_string());
        }
    }
    if matches!(err, sqlx::Error::RowNotFound) {
        return StorageError::NotFound;
    }
    StorageError::Backend(err)
}
