//! The service facade.
//!
//! Every API method runs the same prologue: self-authorization gate (when
//! enabled), consistency validation, request validation, type-system
//! resolution, then the command, then telemetry. The facade owns the
//! resolver stack, the per-family throttlers, the memoized type-system
//! resolver, and the authorizer, and tears them down in reverse order on
//! close.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use warden_domain::expand::{ExpandQuery, ExpandRequest};
use warden_domain::list_objects::{
    ListDispatchThrottling, ListObjectsConfig, ListObjectsQuery, ListObjectsRequest,
    ListObjectsResolutionMetadata,
};
use warden_domain::list_users::{ListUsersConfig, ListUsersQuery, ListUsersRequest};
use warden_domain::model::{
    AuthorizationModel, ObjectRef, TypeSystem, TypesystemResolver, UserRef,
};
use warden_domain::reader::{
    BoundedConcurrencyTupleReader, CombinedTupleReader, RelationshipTupleReader,
};
use warden_domain::resolver::{
    CheckCacheConfig, CheckRequestMetadata, CheckResolver, CheckResolverBuilder,
    CheckResolverCloser, ConsistencyPreference, DispatchThrottlingConfig, LocalCheckerConfig,
    ResolveCheckRequest,
};
use warden_domain::throttler::ConstantRateThrottler;
use warden_domain::DomainError;
use warden_storage::{DataStore, PaginationOptions, TupleFilter};

use crate::adapters::{model_to_stored, stored_to_model, DataStoreModelReader, DataStoreTupleReader};
use crate::authz::{Authorizer, AuthorizerConfig};
use crate::commands::WriteCommand;
use crate::config::{ServerConfig, EXPERIMENTAL_ENABLE_CONSISTENCY_PARAMS};
use crate::context::RequestContext;
use crate::encoder::{Base64Encoder, Encoder};
use crate::errors::{ServerError, ServerResult};
use crate::gateway::{NoopTransport, Transport, AUTHORIZATION_MODEL_ID_HEADER, X_HTTP_CODE_HEADER};
use crate::types::*;

/// The warden service backend.
pub struct Server {
    config: ServerConfig,
    datastore: Arc<dyn DataStore>,
    tuple_reader: Arc<dyn RelationshipTupleReader>,
    typesystem_resolver: Arc<TypesystemResolver>,
    check_resolver: Arc<dyn CheckResolver>,
    check_resolver_closer: Mutex<Option<CheckResolverCloser>>,
    list_objects_throttler: Option<Arc<ConstantRateThrottler>>,
    list_users_throttler: Option<Arc<ConstantRateThrottler>>,
    authorizer: Option<Authorizer>,
    encoder: Arc<dyn Encoder>,
    transport: Arc<dyn Transport>,
}

impl Server {
    /// Builds the server: wraps the datastore, assembles the resolver
    /// stack in its fixed order, and wires the authorizer when
    /// self-authorization is enabled.
    pub fn new(config: ServerConfig, datastore: Arc<dyn DataStore>) -> ServerResult<Self> {
        config
            .validate()
            .map_err(|e| ServerError::Validation(e.to_string()))?;

        let tuple_reader: Arc<dyn RelationshipTupleReader> =
            Arc::new(DataStoreTupleReader::new(Arc::clone(&datastore)));
        let typesystem_resolver = Arc::new(TypesystemResolver::new(
            Arc::new(DataStoreModelReader::new(Arc::clone(&datastore))),
            config.limits.max_authorization_model_cache_size,
        ));

        let mut builder = CheckResolverBuilder::new().with_local_checker_config(
            LocalCheckerConfig {
                breadth_limit: config.limits.resolve_node_breadth_limit,
                userset_batch_size: config.limits.userset_batch_size,
            },
        );
        if config.check_cache.enabled {
            builder = builder.with_cache(CheckCacheConfig {
                max_entries: config.check_cache.limit,
                ttl: std::time::Duration::from_millis(config.check_cache.ttl_ms),
            });
        }
        if config.throttling.check.enabled {
            builder = builder.with_dispatch_throttling(
                DispatchThrottlingConfig {
                    default_threshold: config.throttling.check.default_threshold,
                    max_threshold: config.throttling.check.max_threshold,
                },
                Arc::new(ConstantRateThrottler::new(
                    config.throttling.check.frequency(),
                    "check_dispatch_throttle",
                )),
            );
        }
        builder = builder.with_tracker(config.check_tracker_enabled);
        let (check_resolver, check_resolver_closer) = builder.build();

        let list_objects_throttler = config.throttling.list_objects.enabled.then(|| {
            Arc::new(ConstantRateThrottler::new(
                config.throttling.list_objects.frequency(),
                "list_objects_dispatch_throttle",
            ))
        });
        let list_users_throttler = config.throttling.list_users.enabled.then(|| {
            Arc::new(ConstantRateThrottler::new(
                config.throttling.list_users.frequency(),
                "list_users_dispatch_throttle",
            ))
        });

        let authorizer = if config.fga_on_fga_enabled() {
            Some(Authorizer::new(
                AuthorizerConfig {
                    store_id: config.fga_on_fga.store_id.clone(),
                    model_id: config.fga_on_fga.model_id.clone(),
                    resolve_node_limit: config.limits.resolve_node_limit,
                    max_concurrent_reads: config.limits.max_concurrent_reads_for_check,
                    list_objects_config: ListObjectsConfig {
                        deadline: config.list_objects_deadline(),
                        max_results: 0,
                        breadth_limit: config.limits.resolve_node_breadth_limit,
                        resolve_node_limit: config.limits.resolve_node_limit,
                    },
                },
                Arc::clone(&check_resolver),
                Arc::clone(&typesystem_resolver),
                Arc::clone(&tuple_reader),
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            datastore,
            tuple_reader,
            typesystem_resolver,
            check_resolver,
            check_resolver_closer: Mutex::new(Some(check_resolver_closer)),
            list_objects_throttler,
            list_users_throttler,
            authorizer,
            encoder: Arc::new(Base64Encoder),
            transport: Arc::new(NoopTransport),
        })
    }

    /// Replaces the transport headers are reported through.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Replaces the continuation-token encoder.
    pub fn with_token_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Releases server resources: throttlers, then the resolver chain,
    /// then the memoized type systems. In-flight requests observe
    /// cancellation from their caller.
    pub fn close(&self) {
        tracing::info!("shutting down server resources");
        if let Some(throttler) = &self.list_objects_throttler {
            throttler.close();
        }
        if let Some(throttler) = &self.list_users_throttler {
            throttler.close();
        }
        if let Some(closer) = self
            .check_resolver_closer
            .lock()
            .expect("resolver closer mutex poisoned")
            .take()
        {
            closer.close();
        }
        self.typesystem_resolver.clear();
    }

    // ---- prologue helpers -------------------------------------------------

    /// The self-authorization gate. Denials win over whatever the method
    /// body would have returned.
    async fn check_authz(
        &self,
        ctx: &RequestContext,
        store_id: &str,
        api_method: &str,
        modules: &[String],
    ) -> ServerResult<()> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(());
        };
        if ctx.skip_authz_check {
            return Ok(());
        }

        let client_id = match &ctx.auth_claims {
            Some(claims) if !claims.client_id.is_empty() => claims.client_id.clone(),
            _ => return Err(ServerError::ClientIdNotFound),
        };

        let authorized = authorizer
            .authorize(&client_id, store_id, api_method, modules)
            .await?;
        if !authorized {
            return Err(ServerError::PermissionDenied);
        }
        Ok(())
    }

    async fn check_create_store_authz(&self, ctx: &RequestContext) -> ServerResult<()> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(());
        };
        if ctx.skip_authz_check {
            return Ok(());
        }

        let client_id = match &ctx.auth_claims {
            Some(claims) if !claims.client_id.is_empty() => claims.client_id.clone(),
            _ => return Err(ServerError::ClientIdNotFound),
        };

        if !authorizer.authorize_create_store(&client_id).await? {
            return Err(ServerError::PermissionDenied);
        }
        Ok(())
    }

    fn validate_consistency(&self, consistency: ConsistencyPreference) -> ServerResult<()> {
        if consistency != ConsistencyPreference::Unspecified
            && !self
                .config
                .is_experimentally_enabled(EXPERIMENTAL_ENABLE_CONSISTENCY_PARAMS)
        {
            return Err(ServerError::Validation(
                "consistency parameters are not enabled; enable them with the \
                 `enable-consistency-params` experimental flag"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the type system and reports the resolved model id.
    async fn resolve_typesystem(
        &self,
        store_id: &str,
        model_id: Option<&str>,
    ) -> ServerResult<Arc<TypeSystem>> {
        let typesystem = self
            .typesystem_resolver
            .resolve(store_id, model_id)
            .await
            .map_err(|err| match err {
                DomainError::AuthorizationModelNotFound { .. } => match model_id {
                    Some(id) => ServerError::ModelNotFound(id.to_string()),
                    None => ServerError::LatestModelNotFound(store_id.to_string()),
                },
                other => other.into(),
            })?;

        self.transport.set_header(
            AUTHORIZATION_MODEL_ID_HEADER,
            typesystem.authorization_model_id(),
        );
        Ok(typesystem)
    }

    /// Builds the request-scoped reader: contextual tuples layered over
    /// the datastore, reads gated by the per-request concurrency bound.
    fn request_scoped_reader(
        &self,
        contextual_tuples: &[warden_domain::model::ContextualTuple],
        max_concurrent_reads: u32,
    ) -> ServerResult<Arc<dyn RelationshipTupleReader>> {
        let combined = CombinedTupleReader::new(Arc::clone(&self.tuple_reader), contextual_tuples)
            .map_err(|e| ServerError::Validation(e.to_string()))?;
        Ok(Arc::new(BoundedConcurrencyTupleReader::new(
            Arc::new(combined),
            max_concurrent_reads,
        )))
    }

    // ---- query APIs -------------------------------------------------------

    pub async fn check(
        &self,
        ctx: &RequestContext,
        request: CheckRequest,
    ) -> ServerResult<CheckResponse> {
        self.check_authz(ctx, &request.store_id, "Check", &[]).await?;
        self.validate_consistency(request.consistency)?;

        tracing::debug!(
            store_id = %request.store_id,
            tuple_key = %request.tuple_key,
            consistency = request.consistency.as_str(),
            "check"
        );

        let start = Instant::now();
        let typesystem = self
            .resolve_typesystem(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        typesystem
            .validate_check_key(&request.tuple_key)
            .map_err(|e| ServerError::Validation(e.to_string()))?;
        for tuple in &request.contextual_tuples {
            typesystem
                .validate_contextual_tuple(tuple)
                .map_err(|e| ServerError::Validation(e.to_string()))?;
        }

        let tuple_reader = self.request_scoped_reader(
            &request.contextual_tuples,
            self.config.limits.max_concurrent_reads_for_check,
        )?;

        let metadata = CheckRequestMetadata::new();
        let resolve_request = ResolveCheckRequest {
            store_id: request.store_id.clone(),
            authorization_model_id: typesystem.authorization_model_id().to_string(),
            tuple_key: request.tuple_key.clone(),
            contextual_tuples: Arc::new(request.contextual_tuples),
            context: Arc::new(request.context),
            consistency: request.consistency,
            metadata: Arc::clone(&metadata),
            visited: Arc::new(HashSet::new()),
            remaining_depth: self.config.limits.resolve_node_limit,
            typesystem,
            tuple_reader,
        };

        let response = match tokio::time::timeout(
            self.config.check_request_timeout(),
            self.check_resolver.resolve_check(resolve_request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_elapsed) => {
                if metadata.was_throttled.load(Ordering::Relaxed) {
                    return Err(ServerError::ThrottledTimeout);
                }
                return Err(ServerError::DeadlineExceeded);
            }
        };

        let dispatch_count = metadata.dispatch_counter.load(Ordering::Relaxed);
        let query_count = response.resolution_metadata.datastore_query_count;
        metrics::histogram!("warden_request_duration_ms", "method" => "check")
            .record(start.elapsed().as_millis() as f64);
        metrics::histogram!("warden_dispatch_count", "method" => "check")
            .record(dispatch_count as f64);
        metrics::histogram!("warden_datastore_query_count", "method" => "check")
            .record(query_count as f64);

        Ok(CheckResponse {
            allowed: response.allowed,
            datastore_query_count: query_count,
            dispatch_count,
            cycle_detected: response.resolution_metadata.cycle_detected,
        })
    }

    pub async fn expand(
        &self,
        ctx: &RequestContext,
        request: ExpandApiRequest,
    ) -> ServerResult<ExpandApiResponse> {
        self.check_authz(ctx, &request.store_id, "Expand", &[]).await?;
        self.validate_consistency(request.consistency)?;

        let typesystem = self
            .resolve_typesystem(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        ObjectRef::parse(&request.object).map_err(|e| ServerError::Validation(e.to_string()))?;

        let query = ExpandQuery::new(typesystem, Arc::clone(&self.tuple_reader));
        let tree = query
            .execute(&ExpandRequest {
                store_id: request.store_id,
                object: request.object,
                relation: request.relation,
            })
            .await
            .map_err(ServerError::from)?;

        Ok(ExpandApiResponse { tree })
    }

    pub async fn list_objects(
        &self,
        ctx: &RequestContext,
        request: ListObjectsApiRequest,
    ) -> ServerResult<ListObjectsApiResponse> {
        self.check_authz(ctx, &request.store_id, "ListObjects", &[])
            .await?;

        let (objects, _metadata) = self.list_objects_inner(request, None).await?;
        Ok(ListObjectsApiResponse { objects })
    }

    /// Streamed variant: emits each object into `sink` as it is produced.
    pub async fn streamed_list_objects(
        &self,
        ctx: &RequestContext,
        request: ListObjectsApiRequest,
        sink: mpsc::UnboundedSender<String>,
    ) -> ServerResult<()> {
        self.check_authz(ctx, &request.store_id, "StreamedListObjects", &[])
            .await?;

        self.list_objects_inner(request, Some(sink)).await?;
        Ok(())
    }

    async fn list_objects_inner(
        &self,
        request: ListObjectsApiRequest,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> ServerResult<(Vec<String>, ListObjectsResolutionMetadata)> {
        self.validate_consistency(request.consistency)?;

        let start = Instant::now();
        let typesystem = self
            .resolve_typesystem(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        UserRef::parse(&request.user).map_err(|e| ServerError::Validation(e.to_string()))?;
        typesystem
            .get_relation(&request.object_type, &request.relation)
            .map_err(|e| ServerError::Validation(e.to_string()))?;
        for tuple in &request.contextual_tuples {
            typesystem
                .validate_contextual_tuple(tuple)
                .map_err(|e| ServerError::Validation(e.to_string()))?;
        }

        let tuple_reader = self.request_scoped_reader(
            &request.contextual_tuples,
            self.config.limits.max_concurrent_reads_for_list_objects,
        )?;

        let mut query = ListObjectsQuery::new(
            Arc::clone(&self.check_resolver),
            ListObjectsConfig {
                deadline: self.config.list_objects_deadline(),
                max_results: self.config.limits.list_objects_max_results,
                breadth_limit: self.config.limits.resolve_node_breadth_limit,
                resolve_node_limit: self.config.limits.resolve_node_limit,
            },
        );
        if let Some(throttler) = &self.list_objects_throttler {
            query = query.with_dispatch_throttling(ListDispatchThrottling {
                throttler: Arc::clone(throttler),
                threshold: self.config.throttling.list_objects.default_threshold,
            });
        }

        let domain_request = ListObjectsRequest {
            store_id: request.store_id,
            authorization_model_id: typesystem.authorization_model_id().to_string(),
            object_type: request.object_type,
            relation: request.relation,
            user: request.user,
            contextual_tuples: Arc::new(request.contextual_tuples),
            context: Arc::new(request.context),
            consistency: request.consistency,
            typesystem,
            tuple_reader,
        };

        let (objects, metadata) = match sink {
            Some(sink) => {
                let metadata = query.execute_streamed(domain_request, sink).await?;
                (Vec::new(), metadata)
            }
            None => {
                let result = query.execute(domain_request).await?;
                (result.objects, result.metadata)
            }
        };

        metrics::histogram!("warden_request_duration_ms", "method" => "list_objects")
            .record(start.elapsed().as_millis() as f64);
        metrics::histogram!("warden_dispatch_count", "method" => "list_objects")
            .record(metadata.dispatch_count as f64);
        metrics::histogram!("warden_datastore_query_count", "method" => "list_objects")
            .record(metadata.datastore_query_count as f64);

        Ok((objects, metadata))
    }

    pub async fn list_users(
        &self,
        ctx: &RequestContext,
        request: ListUsersApiRequest,
    ) -> ServerResult<ListUsersApiResponse> {
        self.check_authz(ctx, &request.store_id, "ListUsers", &[])
            .await?;
        self.validate_consistency(request.consistency)?;

        let typesystem = self
            .resolve_typesystem(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        let object =
            ObjectRef::parse(&request.object).map_err(|e| ServerError::Validation(e.to_string()))?;
        typesystem
            .get_relation(&object.object_type, &request.relation)
            .map_err(|e| ServerError::Validation(e.to_string()))?;

        let tuple_reader = self.request_scoped_reader(
            &[],
            self.config.limits.max_concurrent_reads_for_list_users,
        )?;

        let query = ListUsersQuery::new(ListUsersConfig {
            deadline: self.config.list_users_deadline(),
            max_results: self.config.limits.list_users_max_results,
            resolve_node_limit: self.config.limits.resolve_node_limit,
        });
        let result = query
            .execute(ListUsersRequest {
                store_id: request.store_id,
                object: request.object,
                relation: request.relation,
                user_type_filter: request.user_type_filter,
                context: Arc::new(request.context),
                typesystem,
                tuple_reader,
            })
            .await?;

        Ok(ListUsersApiResponse {
            users: result.users,
        })
    }

    // ---- tuple APIs -------------------------------------------------------

    pub async fn read(
        &self,
        ctx: &RequestContext,
        request: ReadRequest,
    ) -> ServerResult<ReadResponse> {
        self.check_authz(ctx, &request.store_id, "Read", &[]).await?;
        self.validate_consistency(request.consistency)?;

        let filter = read_filter(&request)?;
        let pagination = PaginationOptions {
            page_size: request.page_size,
            continuation_token: self.encoder.decode_option(&request.continuation_token)?,
        };

        let page = self
            .datastore
            .read_tuples_paginated(&request.store_id, &filter, &pagination)
            .await?;

        Ok(ReadResponse {
            tuples: page.items,
            continuation_token: self.encoder.encode_option(page.continuation_token),
        })
    }

    pub async fn write(&self, ctx: &RequestContext, request: WriteRequest) -> ServerResult<()> {
        let typesystem = self
            .resolve_typesystem(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        // Modular models authorize writes per touched module; a relation
        // without module metadata falls back to the store-scoped check.
        let modules = modules_for_write(&request, &typesystem)?;
        self.check_authz(ctx, &request.store_id, "Write", &modules)
            .await?;

        tracing::debug!(
            store_id = %request.store_id,
            writes = request.writes.len(),
            deletes = request.deletes.len(),
            "write"
        );

        let command = WriteCommand::new(Arc::clone(&self.datastore));
        command.execute(&typesystem, &request).await
    }

    pub async fn read_changes(
        &self,
        ctx: &RequestContext,
        request: ReadChangesRequest,
    ) -> ServerResult<ReadChangesResponse> {
        self.check_authz(ctx, &request.store_id, "ReadChanges", &[])
            .await?;

        let pagination = PaginationOptions {
            page_size: request.page_size,
            continuation_token: self.encoder.decode_option(&request.continuation_token)?,
        };
        let horizon = chrono::Duration::minutes(
            self.config.deadlines.changelog_horizon_offset_minutes,
        );

        let page = self
            .datastore
            .read_changes(
                &request.store_id,
                request.object_type.as_deref(),
                &pagination,
                horizon,
            )
            .await?;

        Ok(ReadChangesResponse {
            changes: page.items,
            continuation_token: self.encoder.encode_option(page.continuation_token),
        })
    }

    // ---- store APIs -------------------------------------------------------

    pub async fn create_store(
        &self,
        ctx: &RequestContext,
        request: CreateStoreRequest,
    ) -> ServerResult<StoreResponse> {
        self.check_create_store_authz(ctx).await?;

        let id = ulid::Ulid::new().to_string();
        let store = self.datastore.create_store(&id, &request.name).await?;
        self.transport.set_header(X_HTTP_CODE_HEADER, "201");
        Ok(StoreResponse { store })
    }

    pub async fn get_store(
        &self,
        ctx: &RequestContext,
        store_id: &str,
    ) -> ServerResult<StoreResponse> {
        self.check_authz(ctx, store_id, "GetStore", &[]).await?;
        let store = self.datastore.get_store(store_id).await?;
        Ok(StoreResponse { store })
    }

    pub async fn delete_store(&self, ctx: &RequestContext, store_id: &str) -> ServerResult<()> {
        self.check_authz(ctx, store_id, "DeleteStore", &[]).await?;
        self.datastore.delete_store(store_id).await?;
        self.transport.set_header(X_HTTP_CODE_HEADER, "204");
        Ok(())
    }

    /// Lists stores. With self-authorization enabled, the page is filtered
    /// to the caller's accessible stores; an empty intersection is an
    /// empty page, not an error.
    pub async fn list_stores(
        &self,
        ctx: &RequestContext,
        request: ListStoresRequest,
    ) -> ServerResult<ListStoresResponse> {
        let accessible: Option<HashSet<String>> = match &self.authorizer {
            Some(authorizer) if !ctx.skip_authz_check => {
                let client_id = match &ctx.auth_claims {
                    Some(claims) if !claims.client_id.is_empty() => claims.client_id.clone(),
                    _ => return Err(ServerError::ClientIdNotFound),
                };
                Some(
                    authorizer
                        .list_authorized_stores(&client_id)
                        .await?
                        .into_iter()
                        .collect(),
                )
            }
            _ => None,
        };

        let pagination = PaginationOptions {
            page_size: request.page_size,
            continuation_token: self.encoder.decode_option(&request.continuation_token)?,
        };
        let page = self.datastore.list_stores(&pagination).await?;

        let stores = match accessible {
            Some(accessible) => page
                .items
                .into_iter()
                .filter(|store| accessible.contains(&store.id))
                .collect(),
            None => page.items,
        };

        Ok(ListStoresResponse {
            stores,
            continuation_token: self.encoder.encode_option(page.continuation_token),
        })
    }

    // ---- model APIs -------------------------------------------------------

    pub async fn write_authorization_model(
        &self,
        ctx: &RequestContext,
        request: WriteAuthorizationModelRequest,
    ) -> ServerResult<WriteAuthorizationModelResponse> {
        self.check_authz(ctx, &request.store_id, "WriteAuthorizationModel", &[])
            .await?;

        if request.schema_version.is_empty() {
            return Err(ServerError::Validation(
                "schema_version must not be empty".to_string(),
            ));
        }

        let model = AuthorizationModel {
            id: None,
            schema_version: request.schema_version,
            type_definitions: request.type_definitions,
            conditions: request.conditions,
        };
        TypeSystem::new(model.clone())
            .validate_model()
            .map_err(|e| ServerError::Validation(e.to_string()))?;

        let stored = model_to_stored(&request.store_id, &model)?;
        if stored.model_json.len() > self.config.limits.max_authorization_model_size_bytes {
            return Err(ServerError::Validation(format!(
                "authorization model exceeds the maximum size of {} bytes",
                self.config.limits.max_authorization_model_size_bytes
            )));
        }

        let stored = self.datastore.write_authorization_model(stored).await?;
        self.transport.set_header(X_HTTP_CODE_HEADER, "201");
        Ok(WriteAuthorizationModelResponse {
            authorization_model_id: stored.id,
        })
    }

    pub async fn read_authorization_model(
        &self,
        ctx: &RequestContext,
        store_id: &str,
        model_id: &str,
    ) -> ServerResult<ReadAuthorizationModelResponse> {
        self.check_authz(ctx, store_id, "ReadAuthorizationModel", &[])
            .await?;

        let stored = self
            .datastore
            .get_authorization_model(store_id, model_id)
            .await?;
        Ok(ReadAuthorizationModelResponse {
            authorization_model: stored_to_model(&stored)?,
        })
    }

    pub async fn read_authorization_models(
        &self,
        ctx: &RequestContext,
        request: ReadAuthorizationModelsRequest,
    ) -> ServerResult<ReadAuthorizationModelsResponse> {
        self.check_authz(ctx, &request.store_id, "ReadAuthorizationModels", &[])
            .await?;

        let pagination = PaginationOptions {
            page_size: request.page_size,
            continuation_token: self.encoder.decode_option(&request.continuation_token)?,
        };
        let page = self
            .datastore
            .list_authorization_models(&request.store_id, &pagination)
            .await?;

        let authorization_models = page
            .items
            .iter()
            .map(stored_to_model)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReadAuthorizationModelsResponse {
            authorization_models,
            continuation_token: self.encoder.encode_option(page.continuation_token),
        })
    }

    // ---- assertion APIs ---------------------------------------------------

    pub async fn write_assertions(
        &self,
        ctx: &RequestContext,
        request: WriteAssertionsRequest,
    ) -> ServerResult<()> {
        self.check_authz(ctx, &request.store_id, "WriteAssertions", &[])
            .await?;

        let typesystem = self
            .resolve_typesystem(&request.store_id, request.authorization_model_id.as_deref())
            .await?;

        for assertion in &request.assertions {
            typesystem
                .validate_check_key(&warden_domain::model::TupleKey::new(
                    assertion.object.clone(),
                    assertion.relation.clone(),
                    assertion.user.clone(),
                ))
                .map_err(|e| ServerError::Validation(e.to_string()))?;
        }

        self.datastore
            .write_assertions(
                &request.store_id,
                typesystem.authorization_model_id(),
                request.assertions,
            )
            .await?;
        self.transport.set_header(X_HTTP_CODE_HEADER, "204");
        Ok(())
    }

    pub async fn read_assertions(
        &self,
        ctx: &RequestContext,
        store_id: &str,
        authorization_model_id: Option<&str>,
    ) -> ServerResult<ReadAssertionsResponse> {
        self.check_authz(ctx, store_id, "ReadAssertions", &[]).await?;

        let typesystem = self
            .resolve_typesystem(store_id, authorization_model_id)
            .await?;
        let model_id = typesystem.authorization_model_id().to_string();

        let assertions = self.datastore.read_assertions(store_id, &model_id).await?;
        Ok(ReadAssertionsResponse {
            authorization_model_id: model_id,
            assertions,
        })
    }
}

/// Builds a storage filter from a Read request's partial key.
fn read_filter(request: &ReadRequest) -> ServerResult<TupleFilter> {
    let (object_type, object_id) = match &request.object {
        None => (None, None),
        Some(object) => match object.split_once(':') {
            Some((object_type, "")) => (Some(object_type.to_string()), None),
            Some((object_type, object_id)) => {
                (Some(object_type.to_string()), Some(object_id.to_string()))
            }
            None if !object.is_empty() => (Some(object.clone()), None),
            None => (None, None),
        },
    };

    Ok(TupleFilter {
        object_type,
        object_id,
        relation: request.relation.clone(),
        user: request.user.clone(),
    })
}

/// The modules touched by a write batch, or empty when any touched
/// relation lacks module metadata (the caller then checks the store).
fn modules_for_write(
    request: &WriteRequest,
    typesystem: &TypeSystem,
) -> ServerResult<Vec<String>> {
    let mut modules: HashSet<String> = HashSet::new();

    let keys = request
        .writes
        .iter()
        .map(|w| &w.key)
        .chain(request.deletes.iter());
    for key in keys {
        let object =
            ObjectRef::parse(&key.object).map_err(|e| ServerError::Validation(e.to_string()))?;
        let module = typesystem
            .module_for(&object.object_type, &key.relation)
            .map_err(|e| ServerError::Validation(e.to_string()))?;
        match module {
            Some(module) => {
                modules.insert(module);
            }
            None => return Ok(Vec::new()),
        }
    }

    let mut modules: Vec<String> = modules.into_iter().collect();
    modules.sort();
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_domain::model::{
        RelationDefinition, TupleKey, TypeConstraint, TypeDefinition, Userset,
    };

    fn modular_typesystem() -> TypeSystem {
        TypeSystem::new(AuthorizationModel {
            id: Some("model-1".to_string()),
            schema_version: "1.1".to_string(),
            type_definitions: vec![
                TypeDefinition {
                    type_name: "user".to_string(),
                    relations: vec![],
                },
                TypeDefinition {
                    type_name: "document".to_string(),
                    relations: vec![
                        RelationDefinition {
                            name: "viewer".to_string(),
                            rewrite: Userset::This,
                            type_constraints: vec![TypeConstraint::direct("user")],
                            module: Some("docs".to_string()),
                        },
                        RelationDefinition {
                            name: "owner".to_string(),
                            rewrite: Userset::This,
                            type_constraints: vec![TypeConstraint::direct("user")],
                            module: None,
                        },
                    ],
                },
            ],
            conditions: vec![],
        })
    }

    fn write_of(relation: &str) -> WriteRequest {
        WriteRequest {
            store_id: "s".to_string(),
            authorization_model_id: None,
            writes: vec![TupleWrite::new(TupleKey::new(
                "document:1",
                relation,
                "user:anne",
            ))],
            deletes: vec![],
        }
    }

    #[test]
    fn test_modules_collected_when_all_relations_have_modules() {
        let modules = modules_for_write(&write_of("viewer"), &modular_typesystem()).unwrap();
        assert_eq!(modules, vec!["docs"]);
    }

    #[test]
    fn test_module_fallback_to_store_when_metadata_missing() {
        let modules = modules_for_write(&write_of("owner"), &modular_typesystem()).unwrap();
        assert!(modules.is_empty());
    }

    #[test]
    fn test_read_filter_partial_object() {
        let filter = read_filter(&ReadRequest {
            store_id: "s".to_string(),
            object: Some("document:".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(filter.object_type.as_deref(), Some("document"));
        assert!(filter.object_id.is_none());

        let filter = read_filter(&ReadRequest {
            store_id: "s".to_string(),
            object: Some("document:readme".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(filter.object_id.as_deref(), Some("readme"));
    }
}
