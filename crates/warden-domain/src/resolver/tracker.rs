//! Terminal observation layer.
//!
//! Records outcome, duration, dispatch and datastore-query counts for each
//! top-level resolution; never alters the result.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::DomainResult;

use super::{CheckResolver, ResolveCheckRequest, ResolveCheckResponse};

/// Observation layer of the resolver stack.
pub struct TrackerCheckResolver {
    inner: Arc<dyn CheckResolver>,
}

impl TrackerCheckResolver {
    pub fn new(inner: Arc<dyn CheckResolver>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl CheckResolver for TrackerCheckResolver {
    async fn resolve_check(
        &self,
        request: ResolveCheckRequest,
    ) -> DomainResult<ResolveCheckResponse> {
        let start = Instant::now();
        let store_id = request.store_id.clone();
        let tuple_key = request.tuple_key.to_string();
        let metadata = Arc::clone(&request.metadata);

        let result = self.inner.resolve_check(request).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let dispatches = metadata
            .dispatch_counter
            .load(std::sync::atomic::Ordering::Relaxed);

        match &result {
            Ok(response) => {
                tracing::debug!(
                    store_id,
                    tuple_key,
                    allowed = response.allowed,
                    cycle_detected = response.resolution_metadata.cycle_detected,
                    datastore_query_count = response.resolution_metadata.datastore_query_count,
                    dispatches,
                    duration_ms,
                    "check resolved"
                );
                metrics::histogram!("warden_check_duration_ms").record(duration_ms as f64);
                metrics::histogram!("warden_dispatch_count").record(dispatches as f64);
                metrics::histogram!("warden_datastore_query_count")
                    .record(response.resolution_metadata.datastore_query_count as f64);
            }
            Err(error) => {
                tracing::debug!(
                    store_id,
                    tuple_key,
                    %error,
                    dispatches,
                    duration_ms,
                    "check failed"
                );
            }
        }

        result
    }
}
