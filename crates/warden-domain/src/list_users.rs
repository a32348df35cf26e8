//! ListUsers: which users of a type relate to an object?
//!
//! The forward mirror of ListObjects: walk the relation's rewrite from the
//! object, collecting users of the requested type. Usersets and
//! tuple-to-userset edges are followed recursively; set operators combine
//! their branches' user sets. Bounded by a deadline, a max-results limit,
//! and the resolve-node depth budget.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::condition::evaluate_condition;
use crate::error::{DomainError, DomainResult};
use crate::model::{ObjectRef, TypeSystem, UserRef, Userset};
use crate::reader::{RelationshipTupleReader, TupleRef};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tuning for a ListUsers execution.
#[derive(Debug, Clone)]
pub struct ListUsersConfig {
    pub deadline: Duration,
    /// Maximum number of users returned; 0 means unbounded.
    pub max_results: u32,
    /// Depth budget for the forward walk.
    pub resolve_node_limit: u32,
}

impl Default for ListUsersConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3),
            max_results: 1000,
            resolve_node_limit: 25,
        }
    }
}

/// A ListUsers request with its request-scoped resources bound.
#[derive(Clone)]
pub struct ListUsersRequest {
    pub store_id: String,
    pub object: String,
    pub relation: String,
    /// Only users of this type are returned.
    pub user_type_filter: String,
    pub context: Arc<HashMap<String, serde_json::Value>>,
    pub typesystem: Arc<TypeSystem>,
    pub tuple_reader: Arc<dyn RelationshipTupleReader>,
}

/// Result of a ListUsers execution.
#[derive(Debug, Clone)]
pub struct ListUsersResult {
    /// Users in `type:id` form; a typed wildcard is reported as `type:*`.
    pub users: Vec<String>,
    pub datastore_query_count: u32,
    pub deadline_exceeded: bool,
}

/// Executes ListUsers requests.
pub struct ListUsersQuery {
    config: ListUsersConfig,
}

impl ListUsersQuery {
    pub fn new(config: ListUsersConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, request: ListUsersRequest) -> DomainResult<ListUsersResult> {
        let deadline = Instant::now() + self.config.deadline;
        let mut walker = ForwardWalker {
            request: &request,
            budget: self.config.resolve_node_limit,
            query_count: 0,
            visited: HashSet::new(),
        };

        let object = ObjectRef::parse(&request.object)?;
        let walk = walker.users_of(object.clone(), request.relation.clone());

        let (users, deadline_exceeded) = match tokio::time::timeout_at(deadline, walk).await {
            Ok(users) => (users?, false),
            Err(_elapsed) => (HashSet::new(), true),
        };

        let mut users: Vec<String> = users.into_iter().collect();
        users.sort();
        if self.config.max_results > 0 {
            users.truncate(self.config.max_results as usize);
        }

        Ok(ListUsersResult {
            users,
            datastore_query_count: walker.query_count,
            deadline_exceeded,
        })
    }
}

struct ForwardWalker<'a> {
    request: &'a ListUsersRequest,
    budget: u32,
    query_count: u32,
    /// `object#relation` pairs along the walk, cutting cycles.
    visited: HashSet<String>,
}

impl ForwardWalker<'_> {
    fn spend_budget(&mut self) -> DomainResult<()> {
        if self.budget == 0 {
            return Err(DomainError::ResolutionDepthExceeded);
        }
        self.budget -= 1;
        Ok(())
    }

    fn tuple_condition_holds(&self, tuple: &TupleRef) -> DomainResult<bool> {
        match &tuple.condition_name {
            None => Ok(true),
            Some(name) => {
                let condition = self.request.typesystem.get_condition(name)?;
                evaluate_condition(
                    &condition,
                    tuple.condition_context.as_ref(),
                    &self.request.context,
                )
            }
        }
    }

    fn users_of(
        &mut self,
        object: ObjectRef,
        relation: String,
    ) -> BoxFuture<'_, DomainResult<HashSet<String>>> {
        Box::pin(async move {
            let path = format!("{}#{}", object, relation);
            if !self.visited.insert(path.clone()) {
                return Ok(HashSet::new());
            }
            self.spend_budget()?;

            let rewrite = self
                .request
                .typesystem
                .get_relation(&object.object_type, &relation)?
                .rewrite
                .clone();
            let users = self.walk_rewrite(&object, &relation, &rewrite).await;
            self.visited.remove(&path);
            users
        })
    }

    fn walk_rewrite<'s>(
        &'s mut self,
        object: &'s ObjectRef,
        relation: &'s str,
        rewrite: &'s Userset,
    ) -> BoxFuture<'s, DomainResult<HashSet<String>>> {
        Box::pin(async move {
            match rewrite {
                Userset::This => {
                    self.query_count += 1;
                    let tuples = self
                        .request
                        .tuple_reader
                        .read_relation_tuples(
                            &self.request.store_id,
                            &object.object_type,
                            &object.object_id,
                            relation,
                        )
                        .await?;

                    let mut users = HashSet::new();
                    for tuple in tuples {
                        if !self.tuple_condition_holds(&tuple)? {
                            continue;
                        }
                        match tuple.user_ref() {
                            UserRef::Object { user_type, user_id } => {
                                if user_type == self.request.user_type_filter {
                                    users.insert(format!("{}:{}", user_type, user_id));
                                }
                            }
                            UserRef::Wildcard { user_type } => {
                                if user_type == self.request.user_type_filter {
                                    users.insert(format!("{}:*", user_type));
                                }
                            }
                            UserRef::Userset {
                                user_type,
                                user_id,
                                relation: userset_relation,
                            } => {
                                let members = self
                                    .users_of(
                                        ObjectRef::new(user_type, user_id),
                                        userset_relation,
                                    )
                                    .await?;
                                users.extend(members);
                            }
                        }
                    }
                    Ok(users)
                }

                Userset::ComputedUserset { relation: computed } => {
                    self.users_of(object.clone(), computed.clone()).await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    self.query_count += 1;
                    let tuples = self
                        .request
                        .tuple_reader
                        .read_relation_tuples(
                            &self.request.store_id,
                            &object.object_type,
                            &object.object_id,
                            tupleset,
                        )
                        .await?;

                    let mut users = HashSet::new();
                    for tuple in tuples {
                        if matches!(tuple.user_ref(), UserRef::Wildcard { .. }) {
                            continue;
                        }
                        if !self.tuple_condition_holds(&tuple)? {
                            continue;
                        }
                        let parent = ObjectRef::new(
                            tuple.user_type.clone(),
                            tuple.user_id.clone(),
                        );
                        users.extend(
                            self.users_of(parent, computed_userset.clone()).await?,
                        );
                    }
                    Ok(users)
                }

                Userset::Union { children } => {
                    let mut users = HashSet::new();
                    for child in children {
                        users.extend(self.walk_rewrite(object, relation, child).await?);
                    }
                    Ok(users)
                }

                Userset::Intersection { children } => {
                    let mut iter = children.iter();
                    let Some(first) = iter.next() else {
                        return Ok(HashSet::new());
                    };
                    let mut users = self.walk_rewrite(object, relation, first).await?;
                    for child in iter {
                        if users.is_empty() {
                            break;
                        }
                        let other = self.walk_rewrite(object, relation, child).await?;
                        users.retain(|u| other.contains(u));
                    }
                    Ok(users)
                }

                Userset::Exclusion { base, subtract } => {
                    let mut users = self.walk_rewrite(object, relation, base).await?;
                    if !users.is_empty() {
                        let removed = self.walk_rewrite(object, relation, subtract).await?;
                        users.retain(|u| !removed.contains(u));
                    }
                    Ok(users)
                }
            }
        })
    }
}
