//! In-memory storage implementation.
//!
//! Tuples are kept in a per-store `HashMap` keyed by the tuple's
//! (object, relation, user) key, which makes duplicate detection and
//! deletes O(1) and keeps batch writes atomic under a single map entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    parse_continuation_token, validate_store_id, validate_store_name, validate_tuple, Assertion,
    ChangeOperation, DataStore, PaginatedResult, PaginationOptions, Store,
    StoredAuthorizationModel, StoredTuple, TupleChange, TupleFilter,
};

/// In-memory implementation of DataStore.
///
/// Uses `DashMap` for thread-safe concurrent access; each store's tuple set
/// lives under a single map entry so a batch write holds one shard lock for
/// its duration.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    stores: DashMap<String, Store>,
    /// store_id -> tuple key -> tuple.
    tuples: DashMap<String, HashMap<String, StoredTuple>>,
    /// store_id -> models in insertion order (newest last).
    models: DashMap<String, Vec<StoredAuthorizationModel>>,
    /// store_id -> append-only changelog.
    changes: DashMap<String, Vec<TupleChange>>,
    /// (store_id, model_id) -> assertions.
    assertions: DashMap<(String, String), Vec<Assertion>>,
}

impl MemoryDataStore {
    /// Creates a new in-memory data store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory data store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Returns an error unless the store exists and is not soft-deleted.
    fn require_live_store(&self, store_id: &str) -> StorageResult<()> {
        validate_store_id(store_id)?;
        match self.stores.get(store_id) {
            Some(store) if store.deleted_at.is_none() => Ok(()),
            _ => Err(StorageError::StoreNotFound {
                store_id: store_id.to_string(),
            }),
        }
    }
}

fn paginate<T: Clone>(
    items: Vec<T>,
    pagination: &PaginationOptions,
) -> StorageResult<PaginatedResult<T>> {
    let page_size = pagination.page_size.unwrap_or(100) as usize;
    let offset = parse_continuation_token(&pagination.continuation_token)? as usize;

    let page: Vec<T> = items.into_iter().skip(offset).take(page_size).collect();
    let continuation_token = if page.len() == page_size {
        Some((offset + page.len()).to_string())
    } else {
        None
    };

    Ok(PaginatedResult {
        items: page,
        continuation_token,
    })
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn create_store(&self, id: &str, name: &str) -> StorageResult<Store> {
        validate_store_id(id)?;
        validate_store_name(name)?;

        let now = Utc::now();
        let store = Store {
            id: id.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        // Atomic check-and-insert via the entry API.
        use dashmap::mapref::entry::Entry;
        match self.stores.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(StorageError::StoreAlreadyExists {
                    store_id: id.to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(store.clone());
            }
        }

        self.tuples.entry(id.to_string()).or_default();

        Ok(store)
    }

    async fn get_store(&self, id: &str) -> StorageResult<Store> {
        validate_store_id(id)?;
        self.stores
            .get(id)
            .filter(|s| s.deleted_at.is_none())
            .map(|s| s.value().clone())
            .ok_or_else(|| StorageError::StoreNotFound {
                store_id: id.to_string(),
            })
    }

    async fn delete_store(&self, id: &str) -> StorageResult<()> {
        validate_store_id(id)?;
        let mut store = self
            .stores
            .get_mut(id)
            .filter(|s| s.deleted_at.is_none())
            .ok_or_else(|| StorageError::StoreNotFound {
                store_id: id.to_string(),
            })?;

        let now = Utc::now();
        store.deleted_at = Some(now);
        store.updated_at = now;
        Ok(())
    }

    async fn list_stores(
        &self,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<Store>> {
        let mut stores: Vec<Store> = self
            .stores
            .iter()
            .filter(|entry| entry.deleted_at.is_none())
            .map(|entry| entry.value().clone())
            .collect();

        // Newest first, id as tiebreak for a stable page order.
        stores.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        paginate(stores, pagination)
    }

    async fn write_tuples(
        &self,
        store_id: &str,
        writes: Vec<StoredTuple>,
        deletes: Vec<StoredTuple>,
    ) -> StorageResult<()> {
        self.require_live_store(store_id)?;

        for tuple in writes.iter().chain(deletes.iter()) {
            validate_tuple(tuple)?;
        }

        let mut store_tuples = self.tuples.entry(store_id.to_string()).or_default();

        // Validate the whole batch before mutating so failures leave the
        // store untouched.
        for tuple in &writes {
            if store_tuples.contains_key(&tuple.key()) {
                return Err(StorageError::DuplicateTuple {
                    object: tuple.object(),
                    relation: tuple.relation.clone(),
                    user: tuple.user(),
                });
            }
        }
        for tuple in &deletes {
            if !store_tuples.contains_key(&tuple.key()) {
                return Err(StorageError::TupleNotFound {
                    object: tuple.object(),
                    relation: tuple.relation.clone(),
                    user: tuple.user(),
                });
            }
        }

        let now = Utc::now();
        let mut log = self.changes.entry(store_id.to_string()).or_default();

        for tuple in deletes {
            store_tuples.remove(&tuple.key());
            log.push(TupleChange {
                tuple,
                operation: ChangeOperation::Delete,
                timestamp: now,
            });
        }
        for tuple in writes {
            store_tuples.insert(tuple.key(), tuple.clone());
            log.push(TupleChange {
                tuple,
                operation: ChangeOperation::Write,
                timestamp: now,
            });
        }

        Ok(())
    }

    async fn read_tuples(
        &self,
        store_id: &str,
        filter: &TupleFilter,
    ) -> StorageResult<Vec<StoredTuple>> {
        self.require_live_store(store_id)?;

        let mut tuples: Vec<StoredTuple> = self
            .tuples
            .get(store_id)
            .map(|store_tuples| {
                store_tuples
                    .values()
                    .filter(|t| t.matches(filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        tuples.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(tuples)
    }

    async fn read_tuples_paginated(
        &self,
        store_id: &str,
        filter: &TupleFilter,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredTuple>> {
        let tuples = self.read_tuples(store_id, filter).await?;
        paginate(tuples, pagination)
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        user_filter: &[String],
    ) -> StorageResult<Vec<StoredTuple>> {
        self.require_live_store(store_id)?;

        let wanted: HashSet<&str> = user_filter.iter().map(String::as_str).collect();

        let mut tuples: Vec<StoredTuple> = self
            .tuples
            .get(store_id)
            .map(|store_tuples| {
                store_tuples
                    .values()
                    .filter(|t| {
                        t.object_type == object_type
                            && t.relation == relation
                            && wanted.contains(t.user().as_str())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        tuples.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(tuples)
    }

    async fn write_authorization_model(
        &self,
        model: StoredAuthorizationModel,
    ) -> StorageResult<StoredAuthorizationModel> {
        self.require_live_store(&model.store_id)?;

        // Model ids are ULIDs minted by the caller; monotonic per process,
        // so insertion order is also newest-last.
        self.models
            .entry(model.store_id.clone())
            .or_default()
            .push(model.clone());

        Ok(model)
    }

    async fn get_authorization_model(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<StoredAuthorizationModel> {
        self.require_live_store(store_id)?;

        self.models
            .get(store_id)
            .and_then(|models| models.iter().find(|m| m.id == model_id).cloned())
            .ok_or_else(|| StorageError::ModelNotFound {
                model_id: model_id.to_string(),
            })
    }

    async fn get_latest_authorization_model(
        &self,
        store_id: &str,
    ) -> StorageResult<StoredAuthorizationModel> {
        self.require_live_store(store_id)?;

        self.models
            .get(store_id)
            .and_then(|models| {
                models
                    .iter()
                    .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
                    .cloned()
            })
            .ok_or_else(|| StorageError::ModelNotFound {
                model_id: format!("latest model for store {}", store_id),
            })
    }

    async fn list_authorization_models(
        &self,
        store_id: &str,
        pagination: &PaginationOptions,
    ) -> StorageResult<PaginatedResult<StoredAuthorizationModel>> {
        self.require_live_store(store_id)?;

        let mut models: Vec<StoredAuthorizationModel> = self
            .models
            .get(store_id)
            .map(|models| models.clone())
            .unwrap_or_default();

        models.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        paginate(models, pagination)
    }

    async fn read_changes(
        &self,
        store_id: &str,
        object_type: Option<&str>,
        pagination: &PaginationOptions,
        horizon_offset: Duration,
    ) -> StorageResult<PaginatedResult<TupleChange>> {
        self.require_live_store(store_id)?;

        let horizon = Utc::now() - horizon_offset;

        // The changelog is append-only and the horizon only moves forward,
        // so offsets into the type-filtered sequence stay stable across pages.
        let changes: Vec<TupleChange> = self
            .changes
            .get(store_id)
            .map(|log| {
                log.iter()
                    .filter(|c| {
                        object_type.map_or(true, |t| c.tuple.object_type == t)
                            && c.timestamp <= horizon
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        paginate(changes, pagination)
    }

    async fn write_assertions(
        &self,
        store_id: &str,
        model_id: &str,
        assertions: Vec<Assertion>,
    ) -> StorageResult<()> {
        self.require_live_store(store_id)?;

        self.assertions
            .insert((store_id.to_string(), model_id.to_string()), assertions);
        Ok(())
    }

    async fn read_assertions(
        &self,
        store_id: &str,
        model_id: &str,
    ) -> StorageResult<Vec<Assertion>> {
        self.require_live_store(store_id)?;

        Ok(self
            .assertions
            .get(&(store_id.to_string(), model_id.to_string()))
            .map(|a| a.clone())
            .unwrap_or_default())
    }
}
