//! Domain error types for authorization operations.

use thiserror::Error;

/// Domain-specific errors for authorization operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Error parsing a stored authorization model.
    #[error("model parse error: {message}")]
    ModelParseError { message: String },

    /// Error validating an authorization model.
    #[error("model validation error: {message}")]
    ModelValidationError { message: String },

    /// Authorization model not found for a store.
    #[error("authorization model not found for store: {store_id}")]
    AuthorizationModelNotFound { store_id: String },

    /// Store not found (or soft-deleted).
    #[error("store not found: {store_id}")]
    StoreNotFound { store_id: String },

    /// Failed to parse a condition expression.
    #[error("failed to parse condition '{expression}': {reason}")]
    ConditionParseError { expression: String, reason: String },

    /// Condition evaluation failed (missing parameter, type mismatch, ...).
    ///
    /// This is distinct from a condition evaluating to false: false means
    /// the tuple does not match, a failure is surfaced to the caller as a
    /// validation error.
    #[error("condition '{condition_name}' evaluation failed: {reason}")]
    ConditionEvaluationFailed {
        condition_name: String,
        reason: String,
    },

    /// Condition referenced by a tuple is not defined in the model.
    #[error("condition '{condition_name}' not defined in authorization model")]
    ConditionNotFound { condition_name: String },

    /// Storage operation failed during resolution.
    #[error("storage operation failed: {reason}")]
    StorageOperationFailed { reason: String },

    /// Resolution depth budget was exhausted during graph traversal.
    #[error("resolution depth exceeded")]
    ResolutionDepthExceeded,

    /// Invalid user format.
    #[error("invalid user format: {value}")]
    InvalidUserFormat { value: String },

    /// Invalid object format.
    #[error("invalid object format: {value}")]
    InvalidObjectFormat { value: String },

    /// Invalid relation format.
    #[error("invalid relation format: {value}")]
    InvalidRelationFormat { value: String },

    /// Type not found in the authorization model.
    #[error("type not found: {type_name}")]
    TypeNotFound { type_name: String },

    /// Relation not found on a type.
    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },

    /// Tuple violates the type restrictions of the model.
    #[error("tuple validation error: {message}")]
    TupleValidationError { message: String },

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DomainError {
    /// Whether this error is a client-side validation failure, as opposed to
    /// a server-side fault.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DomainError::ConditionParseError { .. }
                | DomainError::ConditionEvaluationFailed { .. }
                | DomainError::ConditionNotFound { .. }
                | DomainError::InvalidUserFormat { .. }
                | DomainError::InvalidObjectFormat { .. }
                | DomainError::InvalidRelationFormat { .. }
                | DomainError::TypeNotFound { .. }
                | DomainError::RelationNotFound { .. }
                | DomainError::TupleValidationError { .. }
                | DomainError::ModelValidationError { .. }
        )
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
