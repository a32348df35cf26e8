//! Adapters that bridge the storage layer to the domain layer.
//!
//! The domain crate defines narrow read traits (`RelationshipTupleReader`,
//! `AuthorizationModelReader`); the storage crate implements `DataStore`.
//! These adapters implement the domain traits over a `DataStore`, plus the
//! serialization between domain models and their stored JSON form.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use warden_domain::error::{DomainError, DomainResult};
use warden_domain::model::{AuthorizationModel, AuthorizationModelReader};
use warden_domain::reader::{RelationshipTupleReader, TupleRef};
use warden_storage::{DataStore, StorageError, StoredAuthorizationModel, StoredTuple, TupleFilter};

fn storage_to_domain(err: StorageError) -> DomainError {
    match err {
        StorageError::StoreNotFound { store_id } => DomainError::StoreNotFound { store_id },
        other => DomainError::StorageOperationFailed {
            reason: other.to_string(),
        },
    }
}

fn tuple_to_ref(tuple: StoredTuple) -> TupleRef {
    TupleRef {
        object_type: tuple.object_type,
        object_id: tuple.object_id,
        relation: tuple.relation,
        user_type: tuple.user_type,
        user_id: tuple.user_id,
        user_relation: tuple.user_relation,
        condition_name: tuple.condition_name,
        condition_context: tuple.condition_context,
    }
}

/// Implements the resolver's tuple reads over a `DataStore`.
pub struct DataStoreTupleReader {
    datastore: Arc<dyn DataStore>,
}

impl DataStoreTupleReader {
    pub fn new(datastore: Arc<dyn DataStore>) -> Self {
        Self { datastore }
    }
}

#[async_trait]
impl RelationshipTupleReader for DataStoreTupleReader {
    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<TupleRef>> {
        let filter = TupleFilter {
            object_type: Some(object_type.to_string()),
            object_id: Some(object_id.to_string()),
            relation: Some(relation.to_string()),
            user: None,
        };
        let tuples = self
            .datastore
            .read_tuples(store_id, &filter)
            .await
            .map_err(storage_to_domain)?;
        Ok(tuples.into_iter().map(tuple_to_ref).collect())
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        user_filter: &[String],
    ) -> DomainResult<Vec<TupleRef>> {
        let tuples = self
            .datastore
            .read_starting_with_user(store_id, object_type, relation, user_filter)
            .await
            .map_err(storage_to_domain)?;
        Ok(tuples.into_iter().map(tuple_to_ref).collect())
    }
}

/// Implements model reads over a `DataStore`.
pub struct DataStoreModelReader {
    datastore: Arc<dyn DataStore>,
}

impl DataStoreModelReader {
    pub fn new(datastore: Arc<dyn DataStore>) -> Self {
        Self { datastore }
    }
}

#[async_trait]
impl AuthorizationModelReader for DataStoreModelReader {
    async fn read_model(
        &self,
        store_id: &str,
        model_id: Option<&str>,
    ) -> DomainResult<AuthorizationModel> {
        let stored = match model_id {
            Some(id) => self.datastore.get_authorization_model(store_id, id).await,
            None => self.datastore.get_latest_authorization_model(store_id).await,
        }
        .map_err(|err| match err {
            StorageError::ModelNotFound { .. } => DomainError::AuthorizationModelNotFound {
                store_id: store_id.to_string(),
            },
            other => storage_to_domain(other),
        })?;

        stored_to_model(&stored)
    }
}

/// Parses a stored model's JSON body into the domain model.
pub fn stored_to_model(stored: &StoredAuthorizationModel) -> DomainResult<AuthorizationModel> {
    let mut model: AuthorizationModel =
        serde_json::from_str(&stored.model_json).map_err(|e| DomainError::ModelParseError {
            message: format!("failed to parse stored model {}: {}", stored.id, e),
        })?;
    model.id = Some(stored.id.clone());
    model.schema_version = stored.schema_version.clone();
    Ok(model)
}

/// Serializes a domain model for persistence under a fresh ULID.
pub fn model_to_stored(
    store_id: &str,
    model: &AuthorizationModel,
) -> DomainResult<StoredAuthorizationModel> {
    let id = model
        .id
        .clone()
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    let model_json = serde_json::to_string(model).map_err(|e| DomainError::ModelParseError {
        message: format!("failed to serialize model: {}", e),
    })?;
    Ok(StoredAuthorizationModel {
        id,
        store_id: store_id.to_string(),
        schema_version: model.schema_version.clone(),
        model_json,
        created_at: Utc::now(),
    })
}
