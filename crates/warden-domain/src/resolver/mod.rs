//! The check-resolver pipeline.
//!
//! A check is answered by a stack of resolvers sharing one contract,
//! assembled outermost-first as
//! **tracker → dispatch throttler → result cache → local graph walker**.
//! Caching sits outside the walker so every recursive sub-dispatch benefits
//! from it; throttling sits outside the cache so throttled requests do not
//! consume cache capacity; the tracker observes the final outcome.
//!
//! The walker's own sub-dispatches re-enter the stack at the outermost
//! layer, closing the ring the way the layers expect.

mod cached;
mod local;
mod throttled;
mod tracker;

pub use cached::{CachedCheckResolver, CheckCacheConfig};
pub use local::{LocalChecker, LocalCheckerConfig};
pub use throttled::{DispatchThrottlingCheckResolver, DispatchThrottlingConfig};
pub use tracker::TrackerCheckResolver;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DomainResult;
use crate::model::{ContextualTuple, TupleKey, TypeSystem};
use crate::reader::RelationshipTupleReader;
use crate::throttler::ConstantRateThrottler;

/// How fresh the data answering a query must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyPreference {
    /// No preference; cached results may be served.
    #[default]
    Unspecified,
    /// Prefer speed; semantically the same as unspecified.
    MinimizeLatency,
    /// Bypass the check result cache and read from the datastore.
    HigherConsistency,
}

impl ConsistencyPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyPreference::Unspecified => "UNSPECIFIED",
            ConsistencyPreference::MinimizeLatency => "MINIMIZE_LATENCY",
            ConsistencyPreference::HigherConsistency => "HIGHER_CONSISTENCY",
        }
    }
}

/// Mutable counters shared by reference across every sub-request spawned
/// from one top-level request. Never copied by value.
#[derive(Debug, Default)]
pub struct CheckRequestMetadata {
    /// Number of dispatches (recursive sub-evaluations) issued so far.
    pub dispatch_counter: AtomicU32,
    /// Set once any layer throttles this request.
    pub was_throttled: AtomicBool,
    /// Per-request throttling threshold override; 0 means use the
    /// resolver's default.
    pub threshold_override: AtomicU32,
}

impl CheckRequestMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A check resolution request.
///
/// Carries the request-scoped resources (type system, tuple reader) bound
/// by the server, the shared metadata counters, and the traversal state
/// (visited paths, remaining depth) for this branch of the evaluation.
#[derive(Clone)]
pub struct ResolveCheckRequest {
    pub store_id: String,
    pub authorization_model_id: String,
    pub tuple_key: TupleKey,
    /// Kept on the request for cache fingerprinting; reads already see
    /// these through the combined reader.
    pub contextual_tuples: Arc<Vec<ContextualTuple>>,
    /// Request-scoped condition evaluation context.
    pub context: Arc<HashMap<String, serde_json::Value>>,
    pub consistency: ConsistencyPreference,
    pub metadata: Arc<CheckRequestMetadata>,
    /// (object, relation, user) triples along the current path.
    pub visited: Arc<HashSet<String>>,
    /// Remaining dispatch depth; zero means the budget is exhausted.
    pub remaining_depth: u32,
    pub typesystem: Arc<TypeSystem>,
    pub tuple_reader: Arc<dyn RelationshipTupleReader>,
}

impl fmt::Debug for ResolveCheckRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveCheckRequest")
            .field("store_id", &self.store_id)
            .field("authorization_model_id", &self.authorization_model_id)
            .field("tuple_key", &self.tuple_key)
            .field("consistency", &self.consistency)
            .field("remaining_depth", &self.remaining_depth)
            .finish_non_exhaustive()
    }
}

impl ResolveCheckRequest {
    /// Derives a sub-request for a recursive evaluation: one depth level
    /// spent, the shared dispatch counter bumped, traversal state carried.
    pub fn dispatch(&self, tuple_key: TupleKey) -> Self {
        self.metadata.dispatch_counter.fetch_add(1, Ordering::Relaxed);
        Self {
            tuple_key,
            remaining_depth: self.remaining_depth.saturating_sub(1),
            ..self.clone()
        }
    }

    /// Returns a copy whose visited set includes `path`.
    pub fn with_visited(&self, path: String) -> Self {
        let mut visited = (*self.visited).clone();
        visited.insert(path);
        Self {
            visited: Arc::new(visited),
            ..self.clone()
        }
    }

    /// Current dispatch count for this top-level request.
    pub fn dispatch_count(&self) -> u32 {
        self.metadata.dispatch_counter.load(Ordering::Relaxed)
    }
}

/// Per-response resolution statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionMetadata {
    /// Datastore queries performed by this frame and the frames below it.
    pub datastore_query_count: u32,
    /// True when the result is `false` because the traversal re-entered a
    /// path it was already on.
    pub cycle_detected: bool,
}

/// The outcome of a check resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveCheckResponse {
    pub allowed: bool,
    pub resolution_metadata: ResolutionMetadata,
}

impl ResolveCheckResponse {
    pub fn allowed(datastore_query_count: u32) -> Self {
        Self {
            allowed: true,
            resolution_metadata: ResolutionMetadata {
                datastore_query_count,
                cycle_detected: false,
            },
        }
    }

    pub fn denied(datastore_query_count: u32) -> Self {
        Self {
            allowed: false,
            resolution_metadata: ResolutionMetadata {
                datastore_query_count,
                cycle_detected: false,
            },
        }
    }

    pub fn cycle() -> Self {
        Self {
            allowed: false,
            resolution_metadata: ResolutionMetadata {
                datastore_query_count: 0,
                cycle_detected: true,
            },
        }
    }
}

/// The contract every pipeline layer implements.
#[async_trait]
pub trait CheckResolver: Send + Sync {
    async fn resolve_check(
        &self,
        request: ResolveCheckRequest,
    ) -> DomainResult<ResolveCheckResponse>;
}

/// Tears down a resolver stack; layers close in reverse build order.
pub struct CheckResolverCloser {
    closers: Vec<Box<dyn FnOnce() + Send>>,
}

impl CheckResolverCloser {
    pub fn close(mut self) {
        while let Some(closer) = self.closers.pop() {
            closer();
        }
    }
}

impl fmt::Debug for CheckResolverCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckResolverCloser")
            .field("layers", &self.closers.len())
            .finish()
    }
}

/// Assembles the resolver stack in its fixed order and returns the
/// outermost resolver plus a teardown handle.
#[derive(Default)]
pub struct CheckResolverBuilder {
    local: LocalCheckerConfig,
    cache: Option<CheckCacheConfig>,
    throttling: Option<(DispatchThrottlingConfig, Arc<ConstantRateThrottler>)>,
    tracker_enabled: bool,
}

impl CheckResolverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_checker_config(mut self, config: LocalCheckerConfig) -> Self {
        self.local = config;
        self
    }

    pub fn with_cache(mut self, config: CheckCacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn with_dispatch_throttling(
        mut self,
        config: DispatchThrottlingConfig,
        throttler: Arc<ConstantRateThrottler>,
    ) -> Self {
        self.throttling = Some((config, throttler));
        self
    }

    pub fn with_tracker(mut self, enabled: bool) -> Self {
        self.tracker_enabled = enabled;
        self
    }

    pub fn build(self) -> (Arc<dyn CheckResolver>, CheckResolverCloser) {
        let mut closers: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

        let local = Arc::new(LocalChecker::new(self.local));
        let mut outer: Arc<dyn CheckResolver> = Arc::clone(&local) as Arc<dyn CheckResolver>;
        closers.push(Box::new(|| {}));

        if let Some(config) = self.cache {
            outer = Arc::new(CachedCheckResolver::new(config, outer));
            closers.push(Box::new(|| {}));
        }

        if let Some((config, throttler)) = self.throttling {
            let close_throttler = Arc::clone(&throttler);
            outer = Arc::new(DispatchThrottlingCheckResolver::new(
                config, throttler, outer,
            ));
            closers.push(Box::new(move || close_throttler.close()));
        }

        if self.tracker_enabled {
            outer = Arc::new(TrackerCheckResolver::new(outer));
            closers.push(Box::new(|| {}));
        }

        // Close the ring: the walker's sub-dispatches re-enter at the top.
        local.set_delegate(Arc::downgrade(&outer));

        (outer, CheckResolverCloser { closers })
    }
}
