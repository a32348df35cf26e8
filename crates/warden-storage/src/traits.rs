//! DataStore trait definition and the record types it persists.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Maximum length for string fields.
const MAX_FIELD_LENGTH: usize = 255;

/// Validate a store ID.
///
/// # Errors
/// Returns `StorageError::InvalidInput` if the store ID is empty or too long.
pub fn validate_store_id(store_id: &str) -> StorageResult<()> {
    if store_id.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "store_id cannot be empty".to_string(),
        });
    }
    if store_id.len() > MAX_FIELD_LENGTH {
        return Err(StorageError::InvalidInput {
            message: format!(
                "store_id exceeds maximum length of {} characters",
                MAX_FIELD_LENGTH
            ),
        });
    }
    Ok(())
}

/// Validate a store name.
///
/// # Errors
/// Returns `StorageError::InvalidInput` if the name is empty or too long.
pub fn validate_store_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "store name cannot be empty".to_string(),
        });
    }
    if name.len() > MAX_FIELD_LENGTH {
        return Err(StorageError::InvalidInput {
            message: format!(
                "store name exceeds maximum length of {} characters",
                MAX_FIELD_LENGTH
            ),
        });
    }
    Ok(())
}

/// Structural validation of a stored tuple.
///
/// Only field presence and length are checked here. Model-level validation
/// (the relation exists, the user type is assignable, the referenced
/// condition is defined) happens against the type system before a write is
/// accepted, not at the storage layer.
pub fn validate_tuple(tuple: &StoredTuple) -> StorageResult<()> {
    let fields = [
        ("object_type", &tuple.object_type),
        ("object_id", &tuple.object_id),
        ("relation", &tuple.relation),
        ("user_type", &tuple.user_type),
        ("user_id", &tuple.user_id),
    ];
    for (name, value) in fields {
        if value.is_empty() {
            return Err(StorageError::InvalidInput {
                message: format!("{} cannot be empty", name),
            });
        }
        if value.len() > MAX_FIELD_LENGTH {
            return Err(StorageError::InvalidInput {
                message: format!(
                    "{} exceeds maximum length of {} characters",
                    name, MAX_FIELD_LENGTH
                ),
            });
        }
    }
    if let Some(ref user_relation) = tuple.user_relation {
        if user_relation.is_empty() || user_relation.len() > MAX_FIELD_LENGTH {
            return Err(StorageError::InvalidInput {
                message: "user_relation must be non-empty and within length limits".to_string(),
            });
        }
    }
    if let Some(ref condition_name) = tuple.condition_name {
        if condition_name.is_empty() || condition_name.len() > MAX_FIELD_LENGTH {
            return Err(StorageError::InvalidInput {
                message: "condition_name must be non-empty and within length limits".to_string(),
            });
        }
    }
    Ok(())
}

/// Parse user filter string into (user_type, user_id, Option<user_relation>).
///
/// # Format
/// - `"type:id"` for direct users
/// - `"type:*"` for typed wildcards
/// - `"type:id#relation"` for usersets
///
/// # Errors
/// Returns `StorageError::InvalidFilter` if the format is invalid.
pub fn parse_user_filter(user: &str) -> StorageResult<(String, String, Option<String>)> {
    let (object_part, relation) = match user.split_once('#') {
        Some((object_part, relation)) => {
            if relation.is_empty() {
                return Err(StorageError::InvalidFilter {
                    message: format!(
                        "invalid user filter '{}': expected 'type:id#relation'",
                        user
                    ),
                });
            }
            (object_part, Some(relation.to_string()))
        }
        None => (user, None),
    };

    match object_part.split_once(':') {
        Some((user_type, user_id)) if !user_type.is_empty() && !user_id.is_empty() => {
            Ok((user_type.to_string(), user_id.to_string(), relation))
        }
        _ => Err(StorageError::InvalidFilter {
            message: format!("invalid user filter '{}': expected 'type:id'", user),
        }),
    }
}

/// Parse an offset-based continuation token.
pub fn parse_continuation_token(token: &Option<String>) -> StorageResult<u64> {
    match token {
        None => Ok(0),
        Some(t) => t
            .parse::<u64>()
            .map_err(|_| StorageError::InvalidContinuationToken {
                message: format!("'{}' is not a valid offset", t),
            }),
    }
}

/// Filter for reading tuples.
#[derive(Debug, Clone, Default)]
pub struct TupleFilter {
    /// Filter by object type.
    pub object_type: Option<String>,
    /// Filter by object ID.
    pub object_id: Option<String>,
    /// Filter by relation.
    pub relation: Option<String>,
    /// Filter by user: `"type:id"`, `"type:*"`, or `"type:id#relation"`.
    pub user: Option<String>,
}

/// A stored relationship tuple.
///
/// Tuples can optionally carry a condition name and condition context.
/// A conditioned tuple only grants access when its condition evaluates to
/// true at check time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTuple {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub user_type: String,
    pub user_id: String,
    /// Set when the user side is a userset reference (`type:id#relation`).
    pub user_relation: Option<String>,
    /// Optional condition name that must be satisfied for this tuple.
    pub condition_name: Option<String>,
    /// Optional condition parameters as JSON key-value pairs.
    pub condition_context: Option<HashMap<String, serde_json::Value>>,
}

impl StoredTuple {
    /// Creates a new StoredTuple without a condition.
    pub fn new(
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
        user_type: impl Into<String>,
        user_id: impl Into<String>,
        user_relation: Option<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            relation: relation.into(),
            user_type: user_type.into(),
            user_id: user_id.into(),
            user_relation,
            condition_name: None,
            condition_context: None,
        }
    }

    /// Creates a new StoredTuple with a condition.
    #[allow(clippy::too_many_arguments)]
    pub fn with_condition(
        object_type: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
        user_type: impl Into<String>,
        user_id: impl Into<String>,
        user_relation: Option<String>,
        condition_name: impl Into<String>,
        condition_context: Option<HashMap<String, serde_json::Value>>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            relation: relation.into(),
            user_type: user_type.into(),
            user_id: user_id.into(),
            user_relation,
            condition_name: Some(condition_name.into()),
            condition_context,
        }
    }

    /// The object in `type:id` form.
    pub fn object(&self) -> String {
        format!("{}:{}", self.object_type, self.object_id)
    }

    /// The user in `type:id` or `type:id#relation` form.
    pub fn user(&self) -> String {
        match &self.user_relation {
            Some(rel) => format!("{}:{}#{}", self.user_type, self.user_id, rel),
            None => format!("{}:{}", self.user_type, self.user_id),
        }
    }

    /// Uniqueness key: tuples are unique on (object, relation, user),
    /// condition excluded.
    pub fn key(&self) -> String {
        format!("{}#{}@{}", self.object(), self.relation, self.user())
    }

    fn matches_user_filter(&self, filter: &str) -> bool {
        self.user() == filter
    }

    /// Whether the tuple matches every set field of the filter.
    pub fn matches(&self, filter: &TupleFilter) -> bool {
        if let Some(ref object_type) = filter.object_type {
            if &self.object_type != object_type {
                return false;
            }
        }
        if let Some(ref object_id) = filter.object_id {
            if &self.object_id != object_id {
                return false;
            }
        }
        if let Some(ref relation) = filter.relation {
            if &self.relation != relation {
                return false;
            }
        }
        if let Some(ref user) = filter.user {
            if !self.matches_user_filter(user) {
                return false;
            }
        }
        true
    }
}

/// Store metadata.
///
/// Stores are soft-deleted: `delete_store` sets `deleted_at` and the store
/// stops resolving, but its row remains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A stored (immutable) authorization model.
///
/// The model body is kept as opaque JSON; parsing into domain types happens
/// in the type-system layer so storage stays schema-agnostic.
#[derive(Debug, Clone)]
pub struct StoredAuthorizationModel {
    pub id: String,
    pub store_id: String,
    pub schema_version: String,
    pub model_json: String,
    pub created_at: DateTime<Utc>,
}

/// The operation recorded in the tuple changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Write,
    Delete,
}

/// One entry of the tuple changelog.
#[derive(Debug, Clone)]
pub struct TupleChange {
    pub tuple: StoredTuple,
    pub operation: ChangeOperation,
    pub timestamp: DateTime<Utc>,
}

/// A stored assertion: an expected check outcome attached to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub object: String,
    pub relation: String,
    pub user: String,
    pub expectation: bool,
}

/// Options for paginated queries.
#[derive(Debug, Clone, Default)]
pub struct PaginationOptions {
    /// Maximum number of results to return.
    pub page_size: Option<u32>,
    /// Continuation token from a previous query.
    pub continuation_token: Option<String>,
}

/// Paginated query result.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    /// The results.
    pub items: Vec<T>,
    /// Token for fetching the next page, if there are more results.
    pub continuation_token: Option<String>,
}

/// Abstract storage interface for authorization data.
///
/// Implementations must be thread-safe (Send + Sync) and support
/// async operations.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    // Store operations

    /// Creates a new store.
    async fn create_store(&self, id: &str, name: &str) -> StorageResult<Store>;

    /// Gets a store by ID. Soft-deleted stores are not found.
    async fn get_store(&self, id: &str) -> StorageResult<Store>;

    /// Soft-deletes a store.
    async fn delete_store(&self, id: &str) -> StorageResult<()>;

    /// Lists live stores with pagination, ordered by creation time descending.
    async fn list_stores(
        &self,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<Store>>;

    // Tuple operations

    /// Atomically applies a batch of writes and deletes.
    ///
    /// Fails with `DuplicateTuple` if a write's (object, relation, user) key
    /// is already present, and `TupleNotFound` if a delete's key is absent.
    /// On failure nothing is applied.
    async fn write_tuples(
        &self,
        store_id: &str,
        writes: Vec<StoredTuple>,
        deletes: Vec<StoredTuple>,
    ) -> StorageResult<()>;

    /// Reads tuples matching the filter.
    async fn read_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
    ) -> StorageResult<Vec<StoredTuple>>;

    /// Reads tuples matching the filter with pagination support.
    async fn read_tuples_paginated(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredTuple>>;

    /// Reverse index read: tuples of `(object_type, _, relation)` whose user
    /// side matches any entry of `user_filter` (`type:id`, `type:*`, or
    /// `type:id#relation`). Used by reverse expansion for ListObjects.
    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        user_filter: &[String],
    ) -> StorageResult<Vec<StoredTuple>>;

    // Authorization model operations

    /// Persists a new immutable authorization model.
    async fn write_authorization_model(
        &self,
        model: StoredAuthorizationModel,
    ) -> StorageResult<StoredAuthorizationModel>;

    /// Gets an authorization model by ID.
    async fn get_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<StoredAuthorizationModel>;

    /// Gets the most recent authorization model for a store.
    async fn get_latest_authorization_model(
        &self,
        store_id: &str,
    ) -> StorageResult<StoredAuthorizationModel>;

    /// Lists authorization models, newest first, with pagination.
    async fn list_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredAuthorizationModel>>;

    // Changelog operations

    /// Reads the tuple changelog in write order.
    ///
    /// Changes newer than `now - horizon_offset` are withheld so that
    /// eventually-consistent replicas have caught up before a change is
    /// observable.
    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
        horizon_offset: Duration,
    ) -> StorageResult<PaginatedResult<TupleChange>>;

    // Assertion operations

    /// Replaces the assertions attached to a model.
    async fn write_assertions(
        &self,
        store_id: &str,
        model_id: &str,
        assertions: Vec<Assertion>,
    ) -> StorageResult<()>;

    /// Reads the assertions attached to a model.
    async fn read_assertions(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<Vec<Assertion>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_filter_direct() {
        let (user_type, user_id, relation) = parse_user_filter("user:alice").unwrap();
        assert_eq!(user_type, "user");
        assert_eq!(user_id, "alice");
        assert!(relation.is_none());
    }

    #[test]
    fn test_parse_user_filter_userset() {
        let (user_type, user_id, relation) = parse_user_filter("group:eng#member").unwrap();
        assert_eq!(user_type, "group");
        assert_eq!(user_id, "eng");
        assert_eq!(relation, Some("member".to_string()));
    }

    #[test]
    fn test_parse_user_filter_wildcard() {
        let (user_type, user_id, relation) = parse_user_filter("user:*").unwrap();
        assert_eq!(user_type, "user");
        assert_eq!(user_id, "*");
        assert!(relation.is_none());
    }

    #[test]
    fn test_parse_user_filter_invalid() {
        assert!(parse_user_filter("alice").is_err());
        assert!(parse_user_filter(":alice").is_err());
        assert!(parse_user_filter("user:").is_err());
        assert!(parse_user_filter("group:eng#").is_err());
    }

    #[test]
    fn test_tuple_key_excludes_condition() {
        let plain = StoredTuple::new("document", "readme", "viewer", "user", "alice", None);
        let conditioned = StoredTuple::with_condition(
            "document",
            "readme",
            "viewer",
            "user",
            "alice",
            None,
            "valid_ip",
            None,
        );
        assert_eq!(plain.key(), conditioned.key());
    }

    #[test]
    fn test_tuple_matches_filter() {
        let tuple = StoredTuple::new("document", "readme", "viewer", "group", "eng", Some("member".to_string()));

        let mut filter = TupleFilter {
            object_type: Some("document".to_string()),
            relation: Some("viewer".to_string()),
            ..Default::default()
        };
        assert!(tuple.matches(&filter));

        filter.user = Some("group:eng#member".to_string());
        assert!(tuple.matches(&filter));

        filter.user = Some("group:eng".to_string());
        assert!(!tuple.matches(&filter));
    }

    #[test]
    fn test_validate_tuple_rejects_empty_fields() {
        let tuple = StoredTuple::new("", "readme", "viewer", "user", "alice", None);
        assert!(matches!(
            validate_tuple(&tuple),
            Err(StorageError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_parse_continuation_token() {
        assert_eq!(parse_continuation_token(&None).unwrap(), 0);
        assert_eq!(
            parse_continuation_token(&Some("42".to_string())).unwrap(),
            42
        );
        assert!(parse_continuation_token(&Some("nope".to_string())).is_err());
    }
}
