//! ListObjects: which objects of a type does a user relate to?
//!
//! Two phases:
//! 1. **Reverse expansion** walks the relation's rewrite backwards from the
//!    user, using the reverse tuple index to enumerate candidate objects.
//!    Set operators are over-approximated (intersection and exclusion
//!    contribute their base branch), so the candidate set may contain
//!    objects the user cannot actually reach.
//! 2. **Confirmation**: every candidate is checked through the resolver
//!    stack. Candidates therefore benefit from the result cache, carry
//!    their own metadata, and are individually throttleable; the emitted
//!    set equals the set a caller would get by checking each object.
//!
//! Stops at the first of: `max_results` emitted, deadline elapsed, caller
//! cancelled, candidates exhausted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{DomainError, DomainResult};
use crate::model::{ContextualTuple, TupleKey, TypeSystem, UserRef, Userset};
use crate::reader::RelationshipTupleReader;
use crate::resolver::{
    CheckRequestMetadata, CheckResolver, ConsistencyPreference, ResolveCheckRequest,
};
use crate::throttler::ConstantRateThrottler;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tuning for a ListObjects execution.
#[derive(Debug, Clone)]
pub struct ListObjectsConfig {
    /// Wall-clock budget for gathering results.
    pub deadline: Duration,
    /// Maximum number of objects returned; 0 means unbounded.
    pub max_results: u32,
    /// Maximum candidate checks in flight.
    pub breadth_limit: u32,
    /// Depth budget for each candidate check and for the reverse walk.
    pub resolve_node_limit: u32,
}

impl Default for ListObjectsConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3),
            max_results: 1000,
            breadth_limit: 100,
            resolve_node_limit: 25,
        }
    }
}

/// Dispatch throttling for the aggregate of all candidate checks.
#[derive(Clone)]
pub struct ListDispatchThrottling {
    pub throttler: Arc<ConstantRateThrottler>,
    pub threshold: u32,
}

/// A ListObjects request with its request-scoped resources bound.
#[derive(Clone)]
pub struct ListObjectsRequest {
    pub store_id: String,
    pub authorization_model_id: String,
    pub object_type: String,
    pub relation: String,
    pub user: String,
    pub contextual_tuples: Arc<Vec<ContextualTuple>>,
    pub context: Arc<HashMap<String, serde_json::Value>>,
    pub consistency: ConsistencyPreference,
    pub typesystem: Arc<TypeSystem>,
    pub tuple_reader: Arc<dyn RelationshipTupleReader>,
}

/// Aggregated counters across the reverse walk and all candidate checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListObjectsResolutionMetadata {
    pub datastore_query_count: u32,
    pub dispatch_count: u32,
    /// True when the deadline cut the result set short.
    pub deadline_exceeded: bool,
}

/// Buffered ListObjects result.
#[derive(Debug, Clone)]
pub struct ListObjectsResult {
    pub objects: Vec<String>,
    pub metadata: ListObjectsResolutionMetadata,
}

/// Executes ListObjects and StreamedListObjects.
pub struct ListObjectsQuery {
    check_resolver: Arc<dyn CheckResolver>,
    config: ListObjectsConfig,
    throttling: Option<ListDispatchThrottling>,
}

impl ListObjectsQuery {
    pub fn new(check_resolver: Arc<dyn CheckResolver>, config: ListObjectsConfig) -> Self {
        Self {
            check_resolver,
            config,
            throttling: None,
        }
    }

    pub fn with_dispatch_throttling(mut self, throttling: ListDispatchThrottling) -> Self {
        self.throttling = Some(throttling);
        self
    }

    /// Buffered variant: collects emitted objects.
    pub async fn execute(&self, request: ListObjectsRequest) -> DomainResult<ListObjectsResult> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let metadata = self.execute_streamed(request, tx).await?;

        let mut objects = Vec::new();
        while let Ok(object) = rx.try_recv() {
            objects.push(object);
        }
        objects.sort();
        Ok(ListObjectsResult { objects, metadata })
    }

    /// Streamed variant: emits objects into `sink` as they are confirmed.
    pub async fn execute_streamed(
        &self,
        request: ListObjectsRequest,
        sink: mpsc::UnboundedSender<String>,
    ) -> DomainResult<ListObjectsResolutionMetadata> {
        let deadline = Instant::now() + self.config.deadline;
        let mut metadata = ListObjectsResolutionMetadata::default();

        // Phase 1: candidate enumeration under the same deadline.
        let mut expander = ReverseExpander::new(&request, self.config.resolve_node_limit);
        let expansion = tokio::time::timeout_at(
            deadline,
            expander.objects_with_relation(&request.object_type, &request.relation),
        )
        .await;
        metadata.datastore_query_count = expander.query_count;
        let candidates = match expansion {
            Ok(candidates) => candidates?,
            Err(_elapsed) => {
                metadata.deadline_exceeded = true;
                return Ok(metadata);
            }
        };

        let mut candidates: Vec<String> = candidates.into_iter().collect();
        candidates.sort();

        // Phase 2: confirm candidates through the resolver stack.
        let breadth = self.config.breadth_limit.max(1) as usize;
        let mut pending: VecDeque<String> = candidates.into();
        let mut in_flight = FuturesUnordered::new();
        let mut emitted = 0u32;

        loop {
            while in_flight.len() < breadth {
                let Some(object) = pending.pop_front() else {
                    break;
                };

                if let Some(throttling) = &self.throttling {
                    if metadata.dispatch_count > throttling.threshold {
                        match tokio::time::timeout_at(deadline, throttling.throttler.acquire())
                            .await
                        {
                            Ok(()) => {}
                            Err(_elapsed) => {
                                metadata.deadline_exceeded = true;
                                return Ok(metadata);
                            }
                        }
                    }
                }

                in_flight.push(self.check_candidate(&request, object));
            }

            if in_flight.is_empty() {
                break;
            }

            let next = match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Ok(next) => next,
                Err(_elapsed) => {
                    metadata.deadline_exceeded = true;
                    break;
                }
            };

            match next {
                None => break,
                Some((object, result)) => {
                    let (allowed, check_metadata) = result?;
                    metadata.datastore_query_count += check_metadata.0;
                    metadata.dispatch_count += check_metadata.1;
                    if allowed {
                        if sink.send(object).is_err() {
                            // Receiver went away; treat as cancellation.
                            break;
                        }
                        emitted += 1;
                        if self.config.max_results > 0 && emitted >= self.config.max_results {
                            break;
                        }
                    }
                }
            }
        }

        Ok(metadata)
    }

    /// Runs one candidate check with its own request metadata.
    fn check_candidate<'a>(
        &'a self,
        request: &'a ListObjectsRequest,
        object: String,
    ) -> BoxFuture<'a, (String, DomainResult<(bool, (u32, u32))>)> {
        Box::pin(async move {
            let metadata = CheckRequestMetadata::new();
            let check_request = ResolveCheckRequest {
                store_id: request.store_id.clone(),
                authorization_model_id: request.authorization_model_id.clone(),
                tuple_key: TupleKey::new(
                    object.clone(),
                    request.relation.clone(),
                    request.user.clone(),
                ),
                contextual_tuples: Arc::clone(&request.contextual_tuples),
                context: Arc::clone(&request.context),
                consistency: request.consistency,
                metadata: Arc::clone(&metadata),
                visited: Arc::new(HashSet::new()),
                remaining_depth: self.config.resolve_node_limit,
                typesystem: Arc::clone(&request.typesystem),
                tuple_reader: Arc::clone(&request.tuple_reader),
            };

            let result = self
                .check_resolver
                .resolve_check(check_request)
                .await
                .map(|response| {
                    (
                        response.allowed,
                        (
                            response.resolution_metadata.datastore_query_count,
                            metadata.dispatch_counter.load(Ordering::Relaxed),
                        ),
                    )
                });
            (object, result)
        })
    }
}

/// Memoized reverse walk over the relation graph.
struct ReverseExpander<'a> {
    request: &'a ListObjectsRequest,
    /// (type, relation) pairs resolved or in progress; in-progress pairs
    /// contribute nothing, cutting mutual recursion.
    memo: HashMap<(String, String), MemoState>,
    /// Remaining expansion steps; exhaustion means the model is too
    /// complex to enumerate.
    budget: u32,
    query_count: u32,
}

enum MemoState {
    InProgress,
    Done(HashSet<String>),
}

impl<'a> ReverseExpander<'a> {
    fn new(request: &'a ListObjectsRequest, budget: u32) -> Self {
        Self {
            request,
            memo: HashMap::new(),
            budget,
            query_count: 0,
        }
    }

    fn spend_budget(&mut self) -> DomainResult<()> {
        if self.budget == 0 {
            return Err(DomainError::ResolutionDepthExceeded);
        }
        self.budget -= 1;
        Ok(())
    }

    /// All objects of `object_type` the request user reaches via
    /// `relation`, possibly over-approximated at intersections/exclusions.
    fn objects_with_relation<'s>(
        &'s mut self,
        object_type: &'s str,
        relation: &'s str,
    ) -> BoxFuture<'s, DomainResult<HashSet<String>>> {
        Box::pin(async move {
            let key = (object_type.to_string(), relation.to_string());
            match self.memo.get(&key) {
                Some(MemoState::Done(objects)) => return Ok(objects.clone()),
                Some(MemoState::InProgress) => return Ok(HashSet::new()),
                None => {}
            }
            self.memo.insert(key.clone(), MemoState::InProgress);

            let rewrite = self
                .request
                .typesystem
                .get_relation(object_type, relation)?
                .rewrite
                .clone();

            // Self-referential tuple-to-userset edges (e.g. a folder
            // hierarchy) grow the result between rounds; iterate until the
            // set stops changing.
            let mut result: HashSet<String> = HashSet::new();
            loop {
                self.spend_budget()?;
                let found = self
                    .expand_once(object_type, relation, &rewrite, &result)
                    .await?;
                let before = result.len();
                result.extend(found);
                if result.len() == before {
                    break;
                }
            }

            self.memo.insert(key, MemoState::Done(result.clone()));
            Ok(result)
        })
    }

    fn expand_once<'s>(
        &'s mut self,
        object_type: &'s str,
        relation: &'s str,
        rewrite: &'s Userset,
        known: &'s HashSet<String>,
    ) -> BoxFuture<'s, DomainResult<HashSet<String>>> {
        Box::pin(async move {
            match rewrite {
                Userset::This => self.expand_direct(object_type, relation).await,

                Userset::ComputedUserset { relation: computed } => {
                    self.objects_with_relation(object_type, computed).await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    self.expand_tuple_to_userset(
                        object_type,
                        relation,
                        tupleset,
                        computed_userset,
                        known,
                    )
                    .await
                }

                Userset::Union { children } => {
                    let mut result = HashSet::new();
                    for child in children {
                        result.extend(
                            self.expand_once(object_type, relation, child, known).await?,
                        );
                    }
                    Ok(result)
                }

                // Over-approximation: only the branch that can grant
                // access contributes candidates; the check phase filters.
                Userset::Intersection { children } => match children.first() {
                    Some(first) => self.expand_once(object_type, relation, first, known).await,
                    None => Ok(HashSet::new()),
                },
                Userset::Exclusion { base, .. } => {
                    self.expand_once(object_type, relation, base, known).await
                }
            }
        })
    }

    /// Direct edges: reverse-index reads for the user, the typed wildcard,
    /// and every userset the user belongs to under a userset restriction.
    async fn expand_direct(
        &mut self,
        object_type: &str,
        relation: &str,
    ) -> DomainResult<HashSet<String>> {
        let restrictions = self
            .request
            .typesystem
            .direct_type_restrictions(object_type, relation)?;
        let user_type = UserRef::parse(&self.request.user)?.user_type().to_string();

        let mut filters: Vec<String> = Vec::new();
        for restriction in restrictions {
            match restriction.relation {
                None if restriction.type_name == user_type => {
                    filters.push(self.request.user.clone());
                    if restriction.wildcard {
                        filters.push(format!("{}:*", user_type));
                    }
                }
                None => {}
                Some(userset_relation) => {
                    let containers = self
                        .objects_with_relation(&restriction.type_name, &userset_relation)
                        .await?;
                    filters.extend(
                        containers
                            .into_iter()
                            .map(|object| format!("{}#{}", object, userset_relation)),
                    );
                }
            }
        }
        filters.sort();
        filters.dedup();

        if filters.is_empty() {
            return Ok(HashSet::new());
        }

        self.query_count += 1;
        let tuples = self
            .request
            .tuple_reader
            .read_starting_with_user(&self.request.store_id, object_type, relation, &filters)
            .await?;
        Ok(tuples.into_iter().map(|t| t.object()).collect())
    }

    /// Tuple-to-userset edges: find parents the user reaches via the
    /// computed relation, then the objects whose tupleset points at them.
    async fn expand_tuple_to_userset(
        &mut self,
        object_type: &str,
        relation: &str,
        tupleset: &str,
        computed_userset: &str,
        known: &HashSet<String>,
    ) -> DomainResult<HashSet<String>> {
        let parent_types: Vec<String> = self
            .request
            .typesystem
            .direct_type_restrictions(object_type, tupleset)?
            .into_iter()
            .filter(|tc| tc.relation.is_none())
            .map(|tc| tc.type_name)
            .collect();

        let mut result = HashSet::new();
        for parent_type in parent_types {
            let parents: HashSet<String> =
                if parent_type == object_type && computed_userset == relation {
                    // The recursive case: parents found in earlier rounds.
                    known.clone()
                } else {
                    self.objects_with_relation(&parent_type, computed_userset)
                        .await?
                };
            if parents.is_empty() {
                continue;
            }

            let filters: Vec<String> = parents.into_iter().collect();
            self.query_count += 1;
            let tuples = self
                .request
                .tuple_reader
                .read_starting_with_user(
                    &self.request.store_id,
                    object_type,
                    tupleset,
                    &filters,
                )
                .await?;
            result.extend(tuples.into_iter().map(|t| t.object()));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AuthorizationModel, RelationDefinition, TypeConstraint, TypeDefinition,
    };
    use crate::reader::test_support::MockTupleReader;
    use crate::resolver::CheckResolverBuilder;

    fn relation_def(
        name: &str,
        rewrite: Userset,
        type_constraints: Vec<TypeConstraint>,
    ) -> RelationDefinition {
        RelationDefinition {
            name: name.to_string(),
            rewrite,
            type_constraints,
            module: None,
        }
    }

    fn hierarchy_model() -> AuthorizationModel {
        AuthorizationModel {
            id: Some("model-1".to_string()),
            schema_version: "1.1".to_string(),
            type_definitions: vec![
                TypeDefinition {
                    type_name: "user".to_string(),
                    relations: vec![],
                },
                TypeDefinition {
                    type_name: "group".to_string(),
                    relations: vec![relation_def(
                        "member",
                        Userset::This,
                        vec![TypeConstraint::direct("user")],
                    )],
                },
                TypeDefinition {
                    type_name: "folder".to_string(),
                    relations: vec![
                        relation_def(
                            "parent",
                            Userset::This,
                            vec![TypeConstraint::direct("folder")],
                        ),
                        relation_def(
                            "viewer",
                            Userset::Union {
                                children: vec![
                                    Userset::This,
                                    Userset::TupleToUserset {
                                        tupleset: "parent".to_string(),
                                        computed_userset: "viewer".to_string(),
                                    },
                                ],
                            },
                            vec![
                                TypeConstraint::direct("user"),
                                TypeConstraint::wildcard("user"),
                                TypeConstraint::userset("group", "member"),
                            ],
                        ),
                    ],
                },
            ],
            conditions: vec![],
        }
    }

    fn make_request(reader: Arc<MockTupleReader>, user: &str) -> ListObjectsRequest {
        ListObjectsRequest {
            store_id: "store-1".to_string(),
            authorization_model_id: "model-1".to_string(),
            object_type: "folder".to_string(),
            relation: "viewer".to_string(),
            user: user.to_string(),
            contextual_tuples: Arc::new(Vec::new()),
            context: Arc::new(HashMap::new()),
            consistency: ConsistencyPreference::Unspecified,
            typesystem: Arc::new(TypeSystem::new(hierarchy_model())),
            tuple_reader: reader,
        }
    }

    fn query() -> ListObjectsQuery {
        let (resolver, _closer) = CheckResolverBuilder::new().build();
        ListObjectsQuery::new(resolver, ListObjectsConfig::default())
    }

    #[tokio::test]
    async fn test_direct_and_inherited_objects() {
        let reader = Arc::new(MockTupleReader::new());
        reader.add("folder:a", "viewer", "user:anne").await;
        reader.add("folder:b", "parent", "folder:a").await;
        reader.add("folder:c", "parent", "folder:b").await;
        reader.add("folder:unrelated", "viewer", "user:bob").await;

        let result = query().execute(make_request(reader, "user:anne")).await.unwrap();
        // anne sees a directly, and b and c through the parent chain.
        assert_eq!(result.objects, vec!["folder:a", "folder:b", "folder:c"]);
    }

    #[tokio::test]
    async fn test_userset_restriction_candidates() {
        let reader = Arc::new(MockTupleReader::new());
        reader.add("group:eng", "member", "user:anne").await;
        reader.add("folder:shared", "viewer", "group:eng#member").await;

        let result = query().execute(make_request(reader, "user:anne")).await.unwrap();
        assert_eq!(result.objects, vec!["folder:shared"]);
    }

    #[tokio::test]
    async fn test_wildcard_candidates() {
        let reader = Arc::new(MockTupleReader::new());
        reader.add("folder:public", "viewer", "user:*").await;

        let result = query().execute(make_request(reader, "user:anne")).await.unwrap();
        assert_eq!(result.objects, vec!["folder:public"]);
    }

    #[tokio::test]
    async fn test_parity_with_check_oracle() {
        let reader = Arc::new(MockTupleReader::new());
        reader.add("folder:a", "viewer", "user:anne").await;
        reader.add("folder:b", "parent", "folder:a").await;
        reader.add("group:eng", "member", "user:anne").await;
        reader.add("folder:c", "viewer", "group:eng#member").await;
        reader.add("folder:d", "viewer", "user:bob").await;

        let listed = query()
            .execute(make_request(Arc::clone(&reader), "user:anne"))
            .await
            .unwrap();

        let (resolver, _closer) = CheckResolverBuilder::new().build();
        for object in ["folder:a", "folder:b", "folder:c", "folder:d"] {
            let request = crate::resolver::test_support::request(
                hierarchy_model(),
                Arc::clone(&reader),
                object,
                "viewer",
                "user:anne",
                25,
            );
            let allowed = resolver.resolve_check(request).await.unwrap().allowed;
            assert_eq!(
                allowed,
                listed.objects.contains(&object.to_string()),
                "parity mismatch for {}",
                object
            );
        }
    }

    #[tokio::test]
    async fn test_max_results_truncation() {
        let reader = Arc::new(MockTupleReader::new());
        for i in 0..10 {
            reader
                .add(&format!("folder:f{}", i), "viewer", "user:anne")
                .await;
        }

        let (resolver, _closer) = CheckResolverBuilder::new().build();
        let query = ListObjectsQuery::new(
            resolver,
            ListObjectsConfig {
                max_results: 3,
                ..Default::default()
            },
        );
        let result = query.execute(make_request(reader, "user:anne")).await.unwrap();
        assert_eq!(result.objects.len(), 3);
    }

    #[tokio::test]
    async fn test_streamed_emits_objects() {
        let reader = Arc::new(MockTupleReader::new());
        reader.add("folder:a", "viewer", "user:anne").await;
        reader.add("folder:b", "viewer", "user:anne").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        query()
            .execute_streamed(make_request(reader, "user:anne"), tx)
            .await
            .unwrap();

        let mut objects = Vec::new();
        while let Some(object) = rx.recv().await {
            objects.push(object);
        }
        objects.sort();
        assert_eq!(objects, vec!["folder:a", "folder:b"]);
    }
}
