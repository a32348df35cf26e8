//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Store not found (or soft-deleted).
    #[error("store not found: {store_id}")]
    StoreNotFound { store_id: String },

    /// Store already exists.
    #[error("store already exists: {store_id}")]
    StoreAlreadyExists { store_id: String },

    /// Authorization model not found.
    #[error("authorization model not found: {model_id}")]
    ModelNotFound { model_id: String },

    /// Tuple to delete was not found.
    #[error("tuple not found: {object}#{relation}@{user}")]
    TupleNotFound {
        object: String,
        relation: String,
        user: String,
    },

    /// Tuple already present for (object, relation, user).
    #[error("duplicate tuple: {object}#{relation}@{user}")]
    DuplicateTuple {
        object: String,
        relation: String,
        user: String,
    },

    /// Continuation token could not be decoded.
    #[error("invalid continuation token: {message}")]
    InvalidContinuationToken { message: String },

    /// Invalid filter specification.
    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
