//! Dispatch throttling layer.
//!
//! Compares the request's running dispatch counter against a threshold;
//! past it, the request must take a ticket from the shared constant-rate
//! throttler before proceeding. Expensive queries are demoted, never
//! rejected. Paired with a caller deadline this produces the
//! throttled-timeout error class at the server boundary.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DomainResult;
use crate::throttler::ConstantRateThrottler;

use super::{CheckResolver, ResolveCheckRequest, ResolveCheckResponse};

/// Threshold configuration for dispatch throttling.
#[derive(Debug, Clone)]
pub struct DispatchThrottlingConfig {
    /// Dispatch count past which requests are throttled.
    pub default_threshold: u32,
    /// Upper bound for per-request threshold overrides; 0 means unbounded.
    pub max_threshold: u32,
}

impl Default for DispatchThrottlingConfig {
    fn default() -> Self {
        Self {
            default_threshold: 100,
            max_threshold: 0,
        }
    }
}

/// Throttling layer of the resolver stack.
pub struct DispatchThrottlingCheckResolver {
    config: DispatchThrottlingConfig,
    throttler: Arc<ConstantRateThrottler>,
    inner: Arc<dyn CheckResolver>,
}

impl DispatchThrottlingCheckResolver {
    pub fn new(
        config: DispatchThrottlingConfig,
        throttler: Arc<ConstantRateThrottler>,
        inner: Arc<dyn CheckResolver>,
    ) -> Self {
        Self {
            config,
            throttler,
            inner,
        }
    }

    fn effective_threshold(&self, request: &ResolveCheckRequest) -> u32 {
        let requested = request.metadata.threshold_override.load(Ordering::Relaxed);
        if requested == 0 {
            return self.config.default_threshold;
        }
        if self.config.max_threshold == 0 {
            requested
        } else {
            requested.min(self.config.max_threshold)
        }
    }
}

#[async_trait]
impl CheckResolver for DispatchThrottlingCheckResolver {
    async fn resolve_check(
        &self,
        request: ResolveCheckRequest,
    ) -> DomainResult<ResolveCheckResponse> {
        let threshold = self.effective_threshold(&request);
        let dispatch_count = request.dispatch_count();

        if dispatch_count > threshold {
            request.metadata.was_throttled.store(true, Ordering::Relaxed);
            tracing::debug!(
                tuple_key = %request.tuple_key,
                dispatch_count,
                threshold,
                "throttling dispatch"
            );
            self.throttler.acquire().await;
        }

        self.inner.resolve_check(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthorizationModel;
    use crate::reader::test_support::MockTupleReader;
    use crate::resolver::test_support::request;
    use crate::resolver::ResolveCheckResponse;
    use std::time::Duration;

    struct AllowAll;

    #[async_trait]
    impl CheckResolver for AllowAll {
        async fn resolve_check(
            &self,
            _request: ResolveCheckRequest,
        ) -> DomainResult<ResolveCheckResponse> {
            Ok(ResolveCheckResponse::allowed(0))
        }
    }

    fn empty_model() -> AuthorizationModel {
        AuthorizationModel {
            id: Some("model-1".to_string()),
            schema_version: "1.1".to_string(),
            type_definitions: vec![],
            conditions: vec![],
        }
    }

    fn make_request() -> ResolveCheckRequest {
        request(
            empty_model(),
            std::sync::Arc::new(MockTupleReader::new()),
            "document:readme",
            "viewer",
            "user:alice",
            25,
        )
    }

    #[tokio::test]
    async fn test_below_threshold_passes_through_immediately() {
        let throttler = Arc::new(ConstantRateThrottler::new(
            Duration::from_secs(3600),
            "test",
        ));
        let resolver = DispatchThrottlingCheckResolver::new(
            DispatchThrottlingConfig {
                default_threshold: 5,
                max_threshold: 0,
            },
            throttler,
            Arc::new(AllowAll),
        );

        let req = make_request();
        let metadata = Arc::clone(&req.metadata);
        let response = tokio::time::timeout(Duration::from_millis(100), resolver.resolve_check(req))
            .await
            .expect("must not block below threshold")
            .unwrap();
        assert!(response.allowed);
        assert!(!metadata.was_throttled.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_above_threshold_waits_and_marks_request() {
        let throttler = Arc::new(ConstantRateThrottler::new(Duration::from_millis(10), "test"));
        let resolver = DispatchThrottlingCheckResolver::new(
            DispatchThrottlingConfig {
                default_threshold: 2,
                max_threshold: 0,
            },
            throttler,
            Arc::new(AllowAll),
        );

        let req = make_request();
        let metadata = Arc::clone(&req.metadata);
        metadata.dispatch_counter.store(10, Ordering::Relaxed);

        let response = resolver.resolve_check(req).await.unwrap();
        assert!(response.allowed);
        assert!(metadata.was_throttled.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_override_is_capped_by_max_threshold() {
        let throttler = Arc::new(ConstantRateThrottler::new(Duration::from_millis(10), "test"));
        let resolver = DispatchThrottlingCheckResolver::new(
            DispatchThrottlingConfig {
                default_threshold: 2,
                max_threshold: 5,
            },
            throttler,
            Arc::new(AllowAll),
        );

        let req = make_request();
        // Asks for a much larger budget than max_threshold allows.
        req.metadata.threshold_override.store(100, Ordering::Relaxed);
        assert_eq!(resolver.effective_threshold(&req), 5);
    }
}
