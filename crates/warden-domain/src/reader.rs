//! The tuple read interface the resolver consumes, plus the request-scoped
//! wrappers layered over it.
//!
//! Per request, the server builds
//! `BoundedConcurrencyTupleReader(CombinedTupleReader(datastore, contextual))`
//! and binds it into the resolve request, so every read a check performs is
//! concurrency-bounded and sees the request's contextual tuples.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{DomainError, DomainResult};
use crate::model::{ContextualTuple, ObjectRef, UserRef};

/// A relationship tuple as the resolver sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleRef {
    pub object_type: String,
    pub object_id: String,
    pub relation: String,
    pub user_type: String,
    pub user_id: String,
    /// Set when the user side is a userset reference.
    pub user_relation: Option<String>,
    /// Optional condition name that must be satisfied for this tuple.
    pub condition_name: Option<String>,
    /// Optional condition parameters.
    pub condition_context: Option<HashMap<String, serde_json::Value>>,
}

impl TupleRef {
    /// The object in `type:id` form.
    pub fn object(&self) -> String {
        format!("{}:{}", self.object_type, self.object_id)
    }

    /// The user in `type:id`, `type:*`, or `type:id#relation` form.
    pub fn user(&self) -> String {
        match &self.user_relation {
            Some(rel) => format!("{}:{}#{}", self.user_type, self.user_id, rel),
            None => format!("{}:{}", self.user_type, self.user_id),
        }
    }

    /// The user side, parsed.
    pub fn user_ref(&self) -> UserRef {
        match (&self.user_relation, self.user_id.as_str()) {
            (Some(relation), _) => UserRef::Userset {
                user_type: self.user_type.clone(),
                user_id: self.user_id.clone(),
                relation: relation.clone(),
            },
            (None, "*") => UserRef::Wildcard {
                user_type: self.user_type.clone(),
            },
            (None, _) => UserRef::Object {
                user_type: self.user_type.clone(),
                user_id: self.user_id.clone(),
            },
        }
    }

    /// Builds a TupleRef from a contextual tuple.
    pub fn from_contextual(tuple: &ContextualTuple) -> DomainResult<Self> {
        let object = ObjectRef::parse(&tuple.key.object)?;
        let user = UserRef::parse(&tuple.key.user)?;
        let (user_type, user_id, user_relation) = match user {
            UserRef::Object { user_type, user_id } => (user_type, user_id, None),
            UserRef::Wildcard { user_type } => (user_type, "*".to_string(), None),
            UserRef::Userset {
                user_type,
                user_id,
                relation,
            } => (user_type, user_id, Some(relation)),
        };
        Ok(Self {
            object_type: object.object_type,
            object_id: object.object_id,
            relation: tuple.key.relation.clone(),
            user_type,
            user_id,
            user_relation,
            condition_name: tuple.condition_name.clone(),
            condition_context: tuple.condition_context.clone(),
        })
    }
}

/// Trait for the tuple reads the resolver and query engines perform.
#[async_trait]
pub trait RelationshipTupleReader: Send + Sync {
    /// Reads the tuples with exactly this (object, relation).
    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<TupleRef>>;

    /// Reverse index read: tuples of (object_type, relation) whose user side
    /// matches any entry of `user_filter`.
    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        user_filter: &[String],
    ) -> DomainResult<Vec<TupleRef>>;
}

/// Wraps a reader so that at most `max_concurrent_reads` datastore reads
/// are in flight at once for the request this reader is bound to.
///
/// Exhaustion queues callers on the semaphore, it never fails them.
pub struct BoundedConcurrencyTupleReader {
    inner: Arc<dyn RelationshipTupleReader>,
    semaphore: Arc<Semaphore>,
}

impl BoundedConcurrencyTupleReader {
    pub fn new(inner: Arc<dyn RelationshipTupleReader>, max_concurrent_reads: u32) -> Self {
        Self {
            inner,
            semaphore: Arc::new(Semaphore::new(max_concurrent_reads.max(1) as usize)),
        }
    }
}

#[async_trait]
impl RelationshipTupleReader for BoundedConcurrencyTupleReader {
    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<TupleRef>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DomainError::Internal {
                message: "tuple reader semaphore closed".to_string(),
            })?;
        self.inner
            .read_relation_tuples(store_id, object_type, object_id, relation)
            .await
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        user_filter: &[String],
    ) -> DomainResult<Vec<TupleRef>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DomainError::Internal {
                message: "tuple reader semaphore closed".to_string(),
            })?;
        self.inner
            .read_starting_with_user(store_id, object_type, relation, user_filter)
            .await
    }
}

/// Unions request-scoped contextual tuples with the persisted tuples of the
/// inner reader. Contextual tuples are returned first and are never written.
pub struct CombinedTupleReader {
    inner: Arc<dyn RelationshipTupleReader>,
    contextual: Vec<TupleRef>,
}

impl CombinedTupleReader {
    pub fn new(
        inner: Arc<dyn RelationshipTupleReader>,
        contextual_tuples: &[ContextualTuple],
    ) -> DomainResult<Self> {
        let contextual = contextual_tuples
            .iter()
            .map(TupleRef::from_contextual)
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(Self { inner, contextual })
    }
}

#[async_trait]
impl RelationshipTupleReader for CombinedTupleReader {
    async fn read_relation_tuples(
        &self,
        store_id: &str,
        object_type: &str,
        object_id: &str,
        relation: &str,
    ) -> DomainResult<Vec<TupleRef>> {
        let mut tuples: Vec<TupleRef> = self
            .contextual
            .iter()
            .filter(|t| {
                t.object_type == object_type && t.object_id == object_id && t.relation == relation
            })
            .cloned()
            .collect();

        tuples.extend(
            self.inner
                .read_relation_tuples(store_id, object_type, object_id, relation)
                .await?,
        );
        Ok(tuples)
    }

    async fn read_starting_with_user(
        &self,
        store_id: &str,
        object_type: &str,
        relation: &str,
        user_filter: &[String],
    ) -> DomainResult<Vec<TupleRef>> {
        let wanted: HashSet<&str> = user_filter.iter().map(String::as_str).collect();

        let mut tuples: Vec<TupleRef> = self
            .contextual
            .iter()
            .filter(|t| {
                t.object_type == object_type
                    && t.relation == relation
                    && wanted.contains(t.user().as_str())
            })
            .cloned()
            .collect();

        tuples.extend(
            self.inner
                .read_starting_with_user(store_id, object_type, relation, user_filter)
                .await?,
        );
        Ok(tuples)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A simple in-memory reader shared by the domain tests.

    use super::*;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MockTupleReader {
        tuples: RwLock<Vec<TupleRef>>,
        pub read_count: std::sync::atomic::AtomicU32,
    }

    impl MockTupleReader {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn add(
            &self,
            object: &str,
            relation: &str,
            user: &str,
        ) {
            self.add_conditioned(object, relation, user, None, None).await;
        }

        pub async fn add_conditioned(
            &self,
            object: &str,
            relation: &str,
            user: &str,
            condition_name: Option<&str>,
            condition_context: Option<HashMap<String, serde_json::Value>>,
        ) {
            let key = crate::model::TupleKey::new(object, relation, user);
            let contextual = ContextualTuple {
                key,
                condition_name: condition_name.map(str::to_string),
                condition_context,
            };
            self.tuples
                .write()
                .await
                .push(TupleRef::from_contextual(&contextual).unwrap());
        }
    }

    #[async_trait]
    impl RelationshipTupleReader for MockTupleReader {
        async fn read_relation_tuples(
            &self,
            _store_id: &str,
            object_type: &str,
            object_id: &str,
            relation: &str,
        ) -> DomainResult<Vec<TupleRef>> {
            self.read_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(self
                .tuples
                .read()
                .await
                .iter()
                .filter(|t| {
                    t.object_type == object_type
                        && t.object_id == object_id
                        && t.relation == relation
                })
                .cloned()
                .collect())
        }

        async fn read_starting_with_user(
            &self,
            _store_id: &str,
            object_type: &str,
            relation: &str,
            user_filter: &[String],
        ) -> DomainResult<Vec<TupleRef>> {
            self.read_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let wanted: HashSet<&str> = user_filter.iter().map(String::as_str).collect();
            Ok(self
                .tuples
                .read()
                .await
                .iter()
                .filter(|t| {
                    t.object_type == object_type
                        && t.relation == relation
                        && wanted.contains(t.user().as_str())
                })
                .cloned()
                .collect())
        }
    }
}
