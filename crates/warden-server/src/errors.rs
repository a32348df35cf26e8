//! Server error taxonomy.
//!
//! Operator-facing message strings for permission-denied and missing
//! client id are stable; tooling matches on them.

use thiserror::Error;
use warden_domain::DomainError;
use warden_storage::StorageError;

/// Coarse error class, the shape an RPC status code is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    Conflict,
    PermissionDenied,
    ResourceExhausted,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

/// Errors surfaced by the server facade.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed request or a tuple/model/condition validation failure.
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("authorization model not found: {0}")]
    ModelNotFound(String),

    /// A store has no model yet and none was named in the request.
    #[error("no authorization models found for store: {0}")]
    LatestModelNotFound(String),

    #[error("tuple already exists: {0}")]
    TupleAlreadyExists(String),

    #[error("tuple not found: {0}")]
    TupleNotFound(String),

    /// Stable message, matched by operators.
    #[error("permission denied")]
    PermissionDenied,

    /// Stable message, matched by operators.
    #[error("client ID not found in context")]
    ClientIdNotFound,

    #[error("unknown api method: {0}")]
    UnknownApiMethod(String),

    /// The model requires more recursion than the configured depth limit.
    #[error("authorization model resolution too complex")]
    ResolutionTooComplex,

    /// Deadline elapsed on a request that was demoted by the dispatch
    /// throttler.
    #[error("timeout due to throttling on complex request")]
    ThrottledTimeout,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Validation(_) | ServerError::UnknownApiMethod(_) => {
                ErrorCode::InvalidArgument
            }
            ServerError::StoreNotFound(_)
            | ServerError::ModelNotFound(_)
            | ServerError::LatestModelNotFound(_)
            | ServerError::TupleNotFound(_) => ErrorCode::NotFound,
            ServerError::TupleAlreadyExists(_) => ErrorCode::Conflict,
            ServerError::PermissionDenied => ErrorCode::PermissionDenied,
            ServerError::ResolutionTooComplex => ErrorCode::ResourceExhausted,
            ServerError::ThrottledTimeout | ServerError::DeadlineExceeded => {
                ErrorCode::DeadlineExceeded
            }
            ServerError::Cancelled => ErrorCode::Cancelled,
            ServerError::ClientIdNotFound | ServerError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<DomainError> for ServerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ResolutionDepthExceeded => ServerError::ResolutionTooComplex,
            DomainError::AuthorizationModelNotFound { store_id } => {
                ServerError::LatestModelNotFound(store_id)
            }
            DomainError::StoreNotFound { store_id } => ServerError::StoreNotFound(store_id),
            DomainError::StorageOperationFailed { reason } => ServerError::Internal(reason),
            DomainError::Internal { message } => ServerError::Internal(message),
            DomainError::ModelParseError { message } => ServerError::Internal(message),
            other if other.is_validation() => ServerError::Validation(other.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::StoreNotFound { store_id } => ServerError::StoreNotFound(store_id),
            StorageError::StoreAlreadyExists { store_id } => {
                ServerError::Validation(format!("store already exists: {}", store_id))
            }
            StorageError::ModelNotFound { model_id } => ServerError::ModelNotFound(model_id),
            StorageError::DuplicateTuple {
                object,
                relation,
                user,
            } => ServerError::TupleAlreadyExists(format!("{}#{}@{}", object, relation, user)),
            StorageError::TupleNotFound {
                object,
                relation,
                user,
            } => ServerError::TupleNotFound(format!("{}#{}@{}", object, relation, user)),
            StorageError::InvalidContinuationToken { message }
            | StorageError::InvalidFilter { message }
            | StorageError::InvalidInput { message } => ServerError::Validation(message),
            StorageError::InternalError { message } => ServerError::Internal(message),
        }
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
