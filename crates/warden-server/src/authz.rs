//! Self-authorization: the service authorizes its own API calls by
//! checking against a meta-store whose model describes who may call what.
//!
//! Each API method maps to a relation on the `store` object of the
//! meta-model; callers are `application:{client_id}` users. Modular write
//! authorization checks `module:{store_id}/{module}` objects instead of
//! the store when every touched relation carries module metadata.
//!
//! The authorizer drives the check resolver directly rather than going
//! back through the server facade, so its own checks structurally cannot
//! recurse through the gate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use warden_domain::list_objects::{ListObjectsConfig, ListObjectsQuery, ListObjectsRequest};
use warden_domain::model::{TupleKey, TypesystemResolver};
use warden_domain::reader::{BoundedConcurrencyTupleReader, RelationshipTupleReader};
use warden_domain::resolver::{
    CheckRequestMetadata, CheckResolver, ConsistencyPreference, ResolveCheckRequest,
};

use crate::errors::{ServerError, ServerResult};

/// Relations of the meta-model, one per API method.
pub const CAN_CALL_CHECK: &str = "can_call_check";
pub const CAN_CALL_EXPAND: &str = "can_call_expand";
pub const CAN_CALL_READ: &str = "can_call_read";
pub const CAN_CALL_WRITE: &str = "can_call_write";
pub const CAN_CALL_LIST_OBJECTS: &str = "can_call_list_objects";
pub const CAN_CALL_LIST_USERS: &str = "can_call_list_users";
pub const CAN_CALL_LIST_STORES: &str = "can_call_list_stores";
pub const CAN_CALL_READ_CHANGES: &str = "can_call_read_changes";
pub const CAN_CALL_CREATE_STORES: &str = "can_call_create_stores";
pub const CAN_CALL_DELETE_STORE: &str = "can_call_delete_store";
pub const CAN_CALL_GET_STORE: &str = "can_call_get_store";
pub const CAN_CALL_READ_AUTHORIZATION_MODELS: &str = "can_call_read_authorization_models";
pub const CAN_CALL_WRITE_AUTHORIZATION_MODELS: &str = "can_call_write_authorization_models";
pub const CAN_CALL_READ_ASSERTIONS: &str = "can_call_read_assertions";
pub const CAN_CALL_WRITE_ASSERTIONS: &str = "can_call_write_assertions";

/// The fixed object that gates store creation.
pub const SYSTEM_OBJECT: &str = "system:fga";

/// Maps an API method name to its meta-model relation.
fn relation_for_method(api_method: &str) -> ServerResult<&'static str> {
    Ok(match api_method {
        "Check" => CAN_CALL_CHECK,
        "Expand" => CAN_CALL_EXPAND,
        "Read" => CAN_CALL_READ,
        "Write" => CAN_CALL_WRITE,
        "ListObjects" | "StreamedListObjects" => CAN_CALL_LIST_OBJECTS,
        "ListUsers" => CAN_CALL_LIST_USERS,
        "ListStores" => CAN_CALL_LIST_STORES,
        "ReadChanges" => CAN_CALL_READ_CHANGES,
        "CreateStore" => CAN_CALL_CREATE_STORES,
        "DeleteStore" => CAN_CALL_DELETE_STORE,
        "GetStore" => CAN_CALL_GET_STORE,
        "ReadAuthorizationModel" | "ReadAuthorizationModels" => CAN_CALL_READ_AUTHORIZATION_MODELS,
        "WriteAuthorizationModel" => CAN_CALL_WRITE_AUTHORIZATION_MODELS,
        "ReadAssertions" => CAN_CALL_READ_ASSERTIONS,
        "WriteAssertions" => CAN_CALL_WRITE_ASSERTIONS,
        other => return Err(ServerError::UnknownApiMethod(other.to_string())),
    })
}

/// Configuration of the meta-store to authorize against.
#[derive(Debug, Clone)]
pub struct AuthorizerConfig {
    pub store_id: String,
    pub model_id: String,
    pub resolve_node_limit: u32,
    pub max_concurrent_reads: u32,
    pub list_objects_config: ListObjectsConfig,
}

/// The self-authorization gate.
pub struct Authorizer {
    config: AuthorizerConfig,
    check_resolver: Arc<dyn CheckResolver>,
    typesystem_resolver: Arc<TypesystemResolver>,
    tuple_reader: Arc<dyn RelationshipTupleReader>,
}

impl Authorizer {
    pub fn new(
        config: AuthorizerConfig,
        check_resolver: Arc<dyn CheckResolver>,
        typesystem_resolver: Arc<TypesystemResolver>,
        tuple_reader: Arc<dyn RelationshipTupleReader>,
    ) -> Self {
        Self {
            config,
            check_resolver,
            typesystem_resolver,
            tuple_reader,
        }
    }

    /// Whether `client_id` may call `api_method` on `store_id`.
    ///
    /// With modules, every module's object must allow the call; without,
    /// the store object decides.
    pub async fn authorize(
        &self,
        client_id: &str,
        store_id: &str,
        api_method: &str,
        modules: &[String],
    ) -> ServerResult<bool> {
        let relation = relation_for_method(api_method)?;
        let user = format!("application:{}", client_id);

        if modules.is_empty() {
            return self
                .meta_check(TupleKey::new(
                    format!("store:{}", store_id),
                    relation,
                    user,
                ))
                .await;
        }

        for module in modules {
            let allowed = self
                .meta_check(TupleKey::new(
                    format!("module:{}/{}", store_id, module),
                    CAN_CALL_WRITE,
                    user.clone(),
                ))
                .await?;
            if !allowed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `client_id` may create stores.
    pub async fn authorize_create_store(&self, client_id: &str) -> ServerResult<bool> {
        self.meta_check(TupleKey::new(
            SYSTEM_OBJECT,
            CAN_CALL_CREATE_STORES,
            format!("application:{}", client_id),
        ))
        .await
    }

    /// The store ids `client_id` is allowed to see.
    pub async fn list_authorized_stores(&self, client_id: &str) -> ServerResult<Vec<String>> {
        let typesystem = self
            .typesystem_resolver
            .resolve(&self.config.store_id, Some(&self.config.model_id))
            .await?;
        let reader: Arc<dyn RelationshipTupleReader> =
            Arc::new(BoundedConcurrencyTupleReader::new(
                Arc::clone(&self.tuple_reader),
                self.config.max_concurrent_reads,
            ));

        let query = ListObjectsQuery::new(
            Arc::clone(&self.check_resolver),
            self.config.list_objects_config.clone(),
        );
        let result = query
            .execute(ListObjectsRequest {
                store_id: self.config.store_id.clone(),
                authorization_model_id: self.config.model_id.clone(),
                object_type: "store".to_string(),
                relation: CAN_CALL_GET_STORE.to_string(),
                user: format!("application:{}", client_id),
                contextual_tuples: Arc::new(Vec::new()),
                context: Arc::new(HashMap::new()),
                consistency: ConsistencyPreference::Unspecified,
                typesystem,
                tuple_reader: reader,
            })
            .await?;

        Ok(result
            .objects
            .into_iter()
            .filter_map(|object| {
                object
                    .strip_prefix("store:")
                    .map(|store_id| store_id.to_string())
            })
            .collect())
    }

    /// One check against the meta-store through the resolver stack.
    async fn meta_check(&self, tuple_key: TupleKey) -> ServerResult<bool> {
        let typesystem = self
            .typesystem_resolver
            .resolve(&self.config.store_id, Some(&self.config.model_id))
            .await?;
        let reader: Arc<dyn RelationshipTupleReader> =
            Arc::new(BoundedConcurrencyTupleReader::new(
                Arc::clone(&self.tuple_reader),
                self.config.max_concurrent_reads,
            ));

        let request = ResolveCheckRequest {
            store_id: self.config.store_id.clone(),
            authorization_model_id: self.config.model_id.clone(),
            tuple_key,
            contextual_tuples: Arc::new(Vec::new()),
            context: Arc::new(HashMap::new()),
            consistency: ConsistencyPreference::Unspecified,
            metadata: CheckRequestMetadata::new(),
            visited: Arc::new(HashSet::new()),
            remaining_depth: self.config.resolve_node_limit,
            typesystem,
            tuple_reader: reader,
        };

        let response = self.check_resolver.resolve_check(request).await?;
        Ok(response.allowed)
    }
}
