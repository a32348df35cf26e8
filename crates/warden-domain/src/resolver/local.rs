//! The local graph walker: resolves a check by walking the relation graph.
//!
//! Recursive sub-evaluations (usersets, computed usersets, tuple-to-userset
//! edges) are dispatched back into the outermost resolver of the stack so
//! they pass through throttling and caching like any top-level check.
//! Union, intersection and exclusion evaluate their branches concurrently
//! with short-circuiting; dropping the remaining futures cancels siblings.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::condition::evaluate_condition;
use crate::error::{DomainError, DomainResult};
use crate::model::{ObjectRef, TupleKey, UserRef, Userset};
use crate::reader::TupleRef;

use super::{CheckResolver, ResolutionMetadata, ResolveCheckRequest, ResolveCheckResponse};

/// Type alias for boxed futures to allow async recursion.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tuning knobs for the graph walker.
#[derive(Debug, Clone)]
pub struct LocalCheckerConfig {
    /// Maximum concurrent sub-evaluations per fan-out (the breadth of one
    /// level of the evaluation tree). Exhaustion queues work, never fails.
    pub breadth_limit: u32,
    /// How many usersets are accumulated before a fan-out starts.
    pub userset_batch_size: u32,
}

impl Default for LocalCheckerConfig {
    fn default() -> Self {
        Self {
            breadth_limit: 100,
            userset_batch_size: 100,
        }
    }
}

/// Graph walker implementing [`CheckResolver`].
pub struct LocalChecker {
    config: LocalCheckerConfig,
    /// The outermost resolver of the stack; sub-dispatches re-enter there.
    /// Weak so the ring of layers does not keep itself alive.
    delegate: OnceLock<Weak<dyn CheckResolver>>,
}

impl LocalChecker {
    pub fn new(config: LocalCheckerConfig) -> Self {
        Self {
            config,
            delegate: OnceLock::new(),
        }
    }

    /// Wires the dispatch target. Called once by the builder.
    pub(crate) fn set_delegate(&self, delegate: Weak<dyn CheckResolver>) {
        let _ = self.delegate.set(delegate);
    }

    fn delegate(&self) -> DomainResult<Arc<dyn CheckResolver>> {
        self.delegate
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| DomainError::Internal {
                message: "check resolver stack has been closed".to_string(),
            })
    }

    /// Evaluates a tuple's condition, if it has one.
    ///
    /// `Ok(false)` means the tuple does not match; evaluation failures and
    /// unknown conditions are typed errors.
    fn tuple_condition_holds(
        &self,
        request: &ResolveCheckRequest,
        tuple: &TupleRef,
    ) -> DomainResult<bool> {
        match &tuple.condition_name {
            None => Ok(true),
            Some(name) => {
                let condition = request.typesystem.get_condition(name)?;
                evaluate_condition(
                    &condition,
                    tuple.condition_context.as_ref(),
                    &request.context,
                )
            }
        }
    }

    fn resolve_rewrite<'a>(
        &'a self,
        request: &'a ResolveCheckRequest,
        rewrite: &'a Userset,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, DomainResult<ResolveCheckResponse>> {
        Box::pin(async move {
            match rewrite {
                Userset::This => self.resolve_direct(request, object).await,

                Userset::ComputedUserset { relation } => {
                    let key = TupleKey::new(
                        request.tuple_key.object.clone(),
                        relation.clone(),
                        request.tuple_key.user.clone(),
                    );
                    // Cycles are caught before re-entering the stack; a
                    // revisited key must never wait on its own ancestor
                    // in the cache layer's singleflight.
                    if request.visited.contains(&key.to_string()) {
                        return Ok(ResolveCheckResponse::cycle());
                    }
                    self.delegate()?.resolve_check(request.dispatch(key)).await
                }

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    self.resolve_tuple_to_userset(request, object, tupleset, computed_userset)
                        .await
                }

                Userset::Union { children } => {
                    let futures = children
                        .iter()
                        .map(|child| self.resolve_rewrite(request, child, object))
                        .collect();
                    self.evaluate_any(futures).await
                }

                Userset::Intersection { children } => {
                    let futures = children
                        .iter()
                        .map(|child| self.resolve_rewrite(request, child, object))
                        .collect();
                    self.evaluate_all(futures).await
                }

                Userset::Exclusion { base, subtract } => {
                    self.evaluate_exclusion(
                        self.resolve_rewrite(request, base, object),
                        self.resolve_rewrite(request, subtract, object),
                    )
                    .await
                }
            }
        })
    }

    /// Direct assignment: scan tuples of (object, relation).
    async fn resolve_direct(
        &self,
        request: &ResolveCheckRequest,
        object: &ObjectRef,
    ) -> DomainResult<ResolveCheckResponse> {
        let tuples = request
            .tuple_reader
            .read_relation_tuples(
                &request.store_id,
                &object.object_type,
                &object.object_id,
                &request.tuple_key.relation,
            )
            .await?;
        let query_count = 1u32;

        let request_user = UserRef::parse(&request.tuple_key.user)?;
        let mut usersets: Vec<TupleKey> = Vec::new();

        for tuple in tuples {
            let tuple_user = tuple.user_ref();

            let exact = tuple_user == request_user;
            let wildcard_covers = matches!(
                (&tuple_user, &request_user),
                (
                    UserRef::Wildcard { user_type },
                    UserRef::Object { user_type: requested, .. },
                ) if user_type == requested
            );

            if exact || wildcard_covers {
                if self.tuple_condition_holds(request, &tuple)? {
                    return Ok(ResolveCheckResponse::allowed(query_count));
                }
                continue;
            }

            if let UserRef::Userset {
                user_type,
                user_id,
                relation,
            } = tuple_user
            {
                if self.tuple_condition_holds(request, &tuple)? {
                    usersets.push(TupleKey::new(
                        format!("{}:{}", user_type, user_id),
                        relation,
                        request.tuple_key.user.clone(),
                    ));
                }
            }
        }

        self.dispatch_any(request, usersets, query_count).await
    }

    /// Tuple-to-userset: follow the tupleset relation to parent objects,
    /// then check the computed relation on each parent.
    async fn resolve_tuple_to_userset(
        &self,
        request: &ResolveCheckRequest,
        object: &ObjectRef,
        tupleset: &str,
        computed_userset: &str,
    ) -> DomainResult<ResolveCheckResponse> {
        let tuples = request
            .tuple_reader
            .read_relation_tuples(
                &request.store_id,
                &object.object_type,
                &object.object_id,
                tupleset,
            )
            .await?;
        let query_count = 1u32;

        let mut dispatches: Vec<TupleKey> = Vec::new();
        for tuple in tuples {
            // A wildcard is not a concrete parent object.
            if matches!(tuple.user_ref(), UserRef::Wildcard { .. }) {
                continue;
            }
            if self.tuple_condition_holds(request, &tuple)? {
                dispatches.push(TupleKey::new(
                    format!("{}:{}", tuple.user_type, tuple.user_id),
                    computed_userset.to_string(),
                    request.tuple_key.user.clone(),
                ));
            }
        }

        self.dispatch_any(request, dispatches, query_count).await
    }

    /// Dispatches the given sub-checks through the stack in batches of
    /// `userset_batch_size`, short-circuiting on the first allowed result.
    ///
    /// Keys already on the current path are cycles and are settled here
    /// without dispatching.
    async fn dispatch_any(
        &self,
        request: &ResolveCheckRequest,
        keys: Vec<TupleKey>,
        base_query_count: u32,
    ) -> DomainResult<ResolveCheckResponse> {
        let mut query_count = base_query_count;
        let mut cycle_detected = false;

        let keys: Vec<TupleKey> = keys
            .into_iter()
            .filter(|key| {
                let revisited = request.visited.contains(&key.to_string());
                cycle_detected |= revisited;
                !revisited
            })
            .collect();
        if keys.is_empty() {
            return Ok(ResolveCheckResponse {
                allowed: false,
                resolution_metadata: ResolutionMetadata {
                    datastore_query_count: query_count,
                    cycle_detected,
                },
            });
        }

        let delegate = self.delegate()?;
        let batch_size = self.config.userset_batch_size.max(1) as usize;

        for batch in keys.chunks(batch_size) {
            let futures: VecDeque<BoxFuture<'_, DomainResult<ResolveCheckResponse>>> = batch
                .iter()
                .map(|key| {
                    let delegate = Arc::clone(&delegate);
                    let sub_request = request.dispatch(key.clone());
                    let future: BoxFuture<'_, DomainResult<ResolveCheckResponse>> =
                        Box::pin(async move { delegate.resolve_check(sub_request).await });
                    future
                })
                .collect();

            let response = self.evaluate_any(futures).await?;
            query_count += response.resolution_metadata.datastore_query_count;
            cycle_detected |= response.resolution_metadata.cycle_detected;
            if response.allowed {
                return Ok(ResolveCheckResponse::allowed(query_count));
            }
        }

        Ok(ResolveCheckResponse {
            allowed: false,
            resolution_metadata: ResolutionMetadata {
                datastore_query_count: query_count,
                cycle_detected,
            },
        })
    }

    /// Union semantics: at most `breadth_limit` branches run concurrently;
    /// the first allowed result wins and the rest are dropped. A branch
    /// ending in a cycle counts as a false result, not an error.
    async fn evaluate_any(
        &self,
        mut pending: VecDeque<BoxFuture<'_, DomainResult<ResolveCheckResponse>>>,
    ) -> DomainResult<ResolveCheckResponse> {
        let breadth = self.config.breadth_limit.max(1) as usize;
        let mut in_flight = FuturesUnordered::new();

        let mut query_count = 0u32;
        let mut cycle_detected = false;
        let mut last_error: Option<DomainError> = None;

        loop {
            while in_flight.len() < breadth {
                match pending.pop_front() {
                    Some(future) => in_flight.push(future),
                    None => break,
                }
            }

            match in_flight.next().await {
                None => break,
                Some(Ok(response)) => {
                    query_count += response.resolution_metadata.datastore_query_count;
                    cycle_detected |= response.resolution_metadata.cycle_detected;
                    if response.allowed {
                        // Dropping in_flight and pending cancels the siblings.
                        return Ok(ResolveCheckResponse::allowed(query_count));
                    }
                }
                Some(Err(e)) => {
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        Ok(ResolveCheckResponse {
            allowed: false,
            resolution_metadata: ResolutionMetadata {
                datastore_query_count: query_count,
                cycle_detected,
            },
        })
    }

    /// Intersection semantics: all branches must allow; the first false
    /// result (or error) short-circuits and cancels the rest.
    async fn evaluate_all(
        &self,
        mut pending: VecDeque<BoxFuture<'_, DomainResult<ResolveCheckResponse>>>,
    ) -> DomainResult<ResolveCheckResponse> {
        if pending.is_empty() {
            return Ok(ResolveCheckResponse::denied(0));
        }

        let breadth = self.config.breadth_limit.max(1) as usize;
        let mut in_flight = FuturesUnordered::new();

        let mut query_count = 0u32;

        loop {
            while in_flight.len() < breadth {
                match pending.pop_front() {
                    Some(future) => in_flight.push(future),
                    None => break,
                }
            }

            match in_flight.next().await {
                None => break,
                Some(Ok(response)) => {
                    query_count += response.resolution_metadata.datastore_query_count;
                    if !response.allowed {
                        return Ok(ResolveCheckResponse {
                            allowed: false,
                            resolution_metadata: ResolutionMetadata {
                                datastore_query_count: query_count,
                                cycle_detected: response.resolution_metadata.cycle_detected,
                            },
                        });
                    }
                }
                Some(Err(e)) => return Err(e),
            }
        }

        Ok(ResolveCheckResponse::allowed(query_count))
    }

    /// Exclusion semantics: allowed iff base allows and subtract does not.
    /// Both run concurrently; the evaluation ends as soon as either side
    /// forces the result.
    async fn evaluate_exclusion(
        &self,
        base: BoxFuture<'_, DomainResult<ResolveCheckResponse>>,
        subtract: BoxFuture<'_, DomainResult<ResolveCheckResponse>>,
    ) -> DomainResult<ResolveCheckResponse> {
        enum Branch {
            Base(DomainResult<ResolveCheckResponse>),
            Subtract(DomainResult<ResolveCheckResponse>),
        }

        let mut in_flight = FuturesUnordered::new();
        in_flight.push(Box::pin(async move { Branch::Base(base.await) })
            as BoxFuture<'_, Branch>);
        in_flight.push(Box::pin(async move { Branch::Subtract(subtract.await) })
            as BoxFuture<'_, Branch>);

        let mut query_count = 0u32;
        let mut base_result: Option<ResolveCheckResponse> = None;
        let mut subtract_result: Option<ResolveCheckResponse> = None;
        let mut base_error: Option<DomainError> = None;
        let mut subtract_error: Option<DomainError> = None;

        while let Some(branch) = in_flight.next().await {
            match branch {
                Branch::Base(Ok(response)) => {
                    query_count += response.resolution_metadata.datastore_query_count;
                    if !response.allowed {
                        // Base is false: the exclusion is false regardless.
                        return Ok(ResolveCheckResponse {
                            allowed: false,
                            resolution_metadata: ResolutionMetadata {
                                datastore_query_count: query_count,
                                cycle_detected: response.resolution_metadata.cycle_detected,
                            },
                        });
                    }
                    base_result = Some(response);
                }
                Branch::Subtract(Ok(response)) => {
                    query_count += response.resolution_metadata.datastore_query_count;
                    if response.allowed {
                        // Subtract is true: the exclusion is false regardless.
                        return Ok(ResolveCheckResponse::denied(query_count));
                    }
                    subtract_result = Some(response);
                }
                Branch::Base(Err(e)) => base_error = Some(e),
                Branch::Subtract(Err(e)) => subtract_error = Some(e),
            }
        }

        // Neither side short-circuited; an errored side is only fatal when
        // its value is still needed for the result.
        match (base_result, subtract_result) {
            (Some(_base), Some(subtract)) => Ok(ResolveCheckResponse {
                allowed: true,
                resolution_metadata: ResolutionMetadata {
                    datastore_query_count: query_count,
                    cycle_detected: subtract.resolution_metadata.cycle_detected,
                },
            }),
            (None, _) => Err(base_error.unwrap_or(DomainError::Internal {
                message: "exclusion base produced no result".to_string(),
            })),
            (_, None) => Err(subtract_error.unwrap_or(DomainError::Internal {
                message: "exclusion subtract produced no result".to_string(),
            })),
        }
    }
}

#[async_trait]
impl CheckResolver for LocalChecker {
    async fn resolve_check(
        &self,
        request: ResolveCheckRequest,
    ) -> DomainResult<ResolveCheckResponse> {
        if request.remaining_depth == 0 {
            return Err(DomainError::ResolutionDepthExceeded);
        }

        let path = request.tuple_key.to_string();
        if request.visited.contains(&path) {
            tracing::debug!(tuple_key = %request.tuple_key, "cycle detected");
            return Ok(ResolveCheckResponse::cycle());
        }
        let request = request.with_visited(path);

        let object = ObjectRef::parse(&request.tuple_key.object)?;
        let relation_def = request
            .typesystem
            .get_relation(&object.object_type, &request.tuple_key.relation)?;

        self.resolve_rewrite(&request, &relation_def.rewrite, &object)
            .await
    }
}
