//! Check result caching with TTL, LRU bounds, and singleflight dedup.
//!
//! Results are keyed by a stable fingerprint of the whole request: store,
//! model, tuple key, contextual tuples (order-independent), request
//! context, and consistency preference. `HIGHER_CONSISTENCY` bypasses the
//! cache entirely, on both the read and the write side.
//!
//! Singleflight: at most one computation per fingerprint is in flight; the
//! walker frequently issues identical sub-checks across the branches of a
//! union, and those callers wait for the leader's result instead of
//! recomputing it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use tokio::sync::broadcast;

use crate::error::DomainResult;

use super::{
    CheckResolver, ConsistencyPreference, ResolveCheckRequest, ResolveCheckResponse,
    ResolutionMetadata,
};

/// Configuration for the check result cache.
#[derive(Debug, Clone)]
pub struct CheckCacheConfig {
    /// Maximum number of entries.
    pub max_entries: u64,
    /// Time-to-live of an entry.
    pub ttl: Duration,
}

impl Default for CheckCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(10),
        }
    }
}

/// Outcome broadcast from a singleflight leader to its followers.
/// `None` means the leader failed; followers recompute for themselves so
/// typed errors are never flattened into strings.
type SingleflightOutcome = Option<(bool, bool)>; // (allowed, cycle_detected)

/// Result of trying to acquire a singleflight slot.
enum SingleflightSlot {
    /// We won the race and should execute the computation.
    Leader(broadcast::Sender<SingleflightOutcome>),
    /// Another task is executing; wait for its result.
    Follower(broadcast::Receiver<SingleflightOutcome>),
}

/// In-flight computation registry keyed by fingerprint.
struct Singleflight {
    in_flight: DashMap<String, broadcast::Sender<SingleflightOutcome>>,
}

impl Singleflight {
    fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Atomically joins or registers the in-flight computation for `key`.
    fn acquire(&self, key: String) -> SingleflightSlot {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => SingleflightSlot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                SingleflightSlot::Leader(tx)
            }
        }
    }

    fn complete(&self, key: &str) {
        self.in_flight.remove(key);
    }
}

/// RAII guard removing the in-flight entry even if the leader's
/// computation panics or is cancelled.
struct SingleflightGuard<'a> {
    singleflight: &'a Singleflight,
    key: &'a str,
}

impl Drop for SingleflightGuard<'_> {
    fn drop(&mut self) {
        self.singleflight.complete(self.key);
    }
}

/// Caching layer of the resolver stack.
pub struct CachedCheckResolver {
    cache: Cache<String, (bool, bool)>,
    singleflight: Singleflight,
    inner: Arc<dyn CheckResolver>,
}

impl CachedCheckResolver {
    pub fn new(config: CheckCacheConfig, inner: Arc<dyn CheckResolver>) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build(),
            singleflight: Singleflight::new(),
            inner,
        }
    }

    /// Approximate number of cached entries (for tests and introspection).
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending cache maintenance; useful when asserting TTL behavior.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// A stable fingerprint of everything that can change the answer.
    fn fingerprint(request: &ResolveCheckRequest) -> String {
        let mut contextual: Vec<String> = request
            .contextual_tuples
            .iter()
            .map(|t| {
                let context = t
                    .condition_context
                    .as_ref()
                    .map(|ctx| {
                        let sorted: BTreeMap<_, _> = ctx.iter().collect();
                        serde_json::to_string(&sorted).unwrap_or_default()
                    })
                    .unwrap_or_default();
                format!(
                    "{}|{}|{}",
                    t.key,
                    t.condition_name.as_deref().unwrap_or(""),
                    context
                )
            })
            .collect();
        contextual.sort();

        let context: BTreeMap<_, _> = request.context.iter().collect();
        let context_json = serde_json::to_string(&context).unwrap_or_default();

        format!(
            "{}/{}/{}/{}/{}/{}",
            request.store_id,
            request.authorization_model_id,
            request.tuple_key,
            contextual.join(","),
            context_json,
            request.consistency.as_str(),
        )
    }

    async fn resolve_uncached(
        &self,
        key: &str,
        request: ResolveCheckRequest,
    ) -> DomainResult<ResolveCheckResponse> {
        let response = self.inner.resolve_check(request).await;

        if let Ok(ref resp) = response {
            // Cycles depend on the path that reached this frame, so they
            // are not safe to replay for other callers.
            if !resp.resolution_metadata.cycle_detected {
                self.cache
                    .insert(
                        key.to_string(),
                        (resp.allowed, resp.resolution_metadata.cycle_detected),
                    )
                    .await;
            }
        }

        response
    }
}

#[async_trait]
impl CheckResolver for CachedCheckResolver {
    async fn resolve_check(
        &self,
        request: ResolveCheckRequest,
    ) -> DomainResult<ResolveCheckResponse> {
        if request.consistency == ConsistencyPreference::HigherConsistency {
            // Bypass: no read, no insert.
            return self.inner.resolve_check(request).await;
        }

        let key = Self::fingerprint(&request);

        if let Some((allowed, cycle_detected)) = self.cache.get(&key).await {
            metrics::counter!("warden_check_cache_hits_total").increment(1);
            return Ok(ResolveCheckResponse {
                allowed,
                resolution_metadata: ResolutionMetadata {
                    datastore_query_count: 0,
                    cycle_detected,
                },
            });
        }
        metrics::counter!("warden_check_cache_misses_total").increment(1);

        match self.singleflight.acquire(key.clone()) {
            SingleflightSlot::Leader(tx) => {
                let _guard = SingleflightGuard {
                    singleflight: &self.singleflight,
                    key: &key,
                };

                let response = self.resolve_uncached(&key, request).await;

                let outcome = response
                    .as_ref()
                    .ok()
                    .map(|r| (r.allowed, r.resolution_metadata.cycle_detected));
                // Send fails only when no follower is waiting.
                let _ = tx.send(outcome);

                response
            }
            // A follower's wait is bounded by its caller's deadline: a
            // cancelled leader drops its guard and sender, which wakes
            // every follower with a recv error.
            SingleflightSlot::Follower(mut rx) => match rx.recv().await {
                Ok(Some((allowed, cycle_detected))) => Ok(ResolveCheckResponse {
                    allowed,
                    resolution_metadata: ResolutionMetadata {
                        datastore_query_count: 0,
                        cycle_detected,
                    },
                }),
                // Leader failed or went away: compute independently.
                Ok(None) | Err(_) => self.resolve_uncached(&key, request).await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use crate::model::{
        AuthorizationModel, ContextualTuple, RelationDefinition, TupleKey, TypeConstraint,
        TypeDefinition, Userset,
    };
    use crate::reader::test_support::MockTupleReader;
    use crate::resolver::test_support::request;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn viewer_model() -> AuthorizationModel {
        AuthorizationModel {
            id: Some("model-1".to_string()),
            schema_version: "1.1".to_string(),
            type_definitions: vec![
                TypeDefinition {
                    type_name: "user".to_string(),
                    relations: vec![],
                },
                TypeDefinition {
                    type_name: "document".to_string(),
                    relations: vec![RelationDefinition {
                        name: "viewer".to_string(),
                        rewrite: Userset::This,
                        type_constraints: vec![TypeConstraint::direct("user")],
                        module: None,
                    }],
                },
            ],
            conditions: Vec::new(),
        }
    }

    /// Inner resolver that counts invocations and returns a fixed answer.
    struct CountingResolver {
        calls: AtomicU32,
        allowed: bool,
    }

    #[async_trait]
    impl CheckResolver for CountingResolver {
        async fn resolve_check(
            &self,
            _request: ResolveCheckRequest,
        ) -> DomainResult<ResolveCheckResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolveCheckResponse {
                allowed: self.allowed,
                resolution_metadata: ResolutionMetadata {
                    datastore_query_count: 1,
                    cycle_detected: false,
                },
            })
        }
    }

    fn cached_over_counting(
        allowed: bool,
    ) -> (Arc<CountingResolver>, CachedCheckResolver) {
        let counting = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            allowed,
        });
        let cached = CachedCheckResolver::new(
            CheckCacheConfig::default(),
            Arc::clone(&counting) as Arc<dyn CheckResolver>,
        );
        (counting, cached)
    }

    fn make_request() -> ResolveCheckRequest {
        request(
            viewer_model(),
            Arc::new(MockTupleReader::new()),
            "document:readme",
            "viewer",
            "user:alice",
            25,
        )
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner_and_reports_zero_queries() {
        let (counting, cached) = cached_over_counting(true);

        let first = cached.resolve_check(make_request()).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.resolution_metadata.datastore_query_count, 1);

        let second = cached.resolve_check(make_request()).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.resolution_metadata.datastore_query_count, 0);

        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_higher_consistency_bypasses_cache() {
        let (counting, cached) = cached_over_counting(true);

        let mut req = make_request();
        req.consistency = ConsistencyPreference::HigherConsistency;
        cached.resolve_check(req).await.unwrap();

        let mut req = make_request();
        req.consistency = ConsistencyPreference::HigherConsistency;
        cached.resolve_check(req).await.unwrap();

        // Both calls went to the inner resolver, and nothing was cached.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        cached.run_pending_tasks().await;
        assert_eq!(cached.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_fingerprint_is_order_independent_for_contextual_tuples() {
        let a = ContextualTuple::new(TupleKey::new("document:1", "viewer", "user:a"));
        let b = ContextualTuple::new(TupleKey::new("document:2", "viewer", "user:b"));

        let mut first = make_request();
        first.contextual_tuples = Arc::new(vec![a.clone(), b.clone()]);
        let mut second = make_request();
        second.contextual_tuples = Arc::new(vec![b, a]);

        assert_eq!(
            CachedCheckResolver::fingerprint(&first),
            CachedCheckResolver::fingerprint(&second)
        );
    }

    #[tokio::test]
    async fn test_fingerprint_differs_by_context() {
        let mut first = make_request();
        let mut ctx = std::collections::HashMap::new();
        ctx.insert("amount".to_string(), serde_json::json!(1));
        first.context = Arc::new(ctx);

        let second = make_request();
        assert_ne!(
            CachedCheckResolver::fingerprint(&first),
            CachedCheckResolver::fingerprint(&second)
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_causes_recompute() {
        let counting = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            allowed: true,
        });
        let cached = CachedCheckResolver::new(
            CheckCacheConfig {
                max_entries: 100,
                ttl: Duration::from_millis(20),
            },
            Arc::clone(&counting) as Arc<dyn CheckResolver>,
        );

        cached.resolve_check(make_request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cached.run_pending_tasks().await;
        cached.resolve_check(make_request()).await.unwrap();

        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_singleflight_deduplicates_concurrent_callers() {
        struct SlowResolver {
            calls: AtomicU32,
        }

        #[async_trait]
        impl CheckResolver for SlowResolver {
            async fn resolve_check(
                &self,
                _request: ResolveCheckRequest,
            ) -> DomainResult<ResolveCheckResponse> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(ResolveCheckResponse::allowed(1))
            }
        }

        let slow = Arc::new(SlowResolver {
            calls: AtomicU32::new(0),
        });
        let cached = Arc::new(CachedCheckResolver::new(
            CheckCacheConfig::default(),
            Arc::clone(&slow) as Arc<dyn CheckResolver>,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cached = Arc::clone(&cached);
            handles.push(tokio::spawn(async move {
                cached.resolve_check(make_request()).await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().allowed);
        }

        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        struct FailingOnce {
            calls: AtomicU32,
        }

        #[async_trait]
        impl CheckResolver for FailingOnce {
            async fn resolve_check(
                &self,
                _request: ResolveCheckRequest,
            ) -> DomainResult<ResolveCheckResponse> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DomainError::StorageOperationFailed {
                        reason: "transient".to_string(),
                    })
                } else {
                    Ok(ResolveCheckResponse::allowed(1))
                }
            }
        }

        let inner = Arc::new(FailingOnce {
            calls: AtomicU32::new(0),
        });
        let cached = CachedCheckResolver::new(
            CheckCacheConfig::default(),
            Arc::clone(&inner) as Arc<dyn CheckResolver>,
        );

        assert!(cached.resolve_check(make_request()).await.is_err());
        // The failure was not cached; the retry reaches the inner resolver.
        assert!(cached.resolve_check(make_request()).await.unwrap().allowed);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
