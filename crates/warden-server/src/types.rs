//! API request and response types for the server facade.

use std::collections::HashMap;

use warden_domain::expand::UsersetTree;
use warden_domain::model::{AuthorizationModel, Condition, ContextualTuple, TupleKey, TypeDefinition};
use warden_domain::resolver::ConsistencyPreference;
use warden_storage::{Assertion, Store, TupleChange};

/// Check: is the user related to the object via the relation?
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub store_id: String,
    /// Empty means "the store's latest model".
    pub authorization_model_id: Option<String>,
    pub tuple_key: TupleKey,
    pub contextual_tuples: Vec<ContextualTuple>,
    pub context: HashMap<String, serde_json::Value>,
    pub consistency: ConsistencyPreference,
}

impl CheckRequest {
    pub fn new(store_id: impl Into<String>, tuple_key: TupleKey) -> Self {
        Self {
            store_id: store_id.into(),
            authorization_model_id: None,
            tuple_key,
            contextual_tuples: Vec::new(),
            context: HashMap::new(),
            consistency: ConsistencyPreference::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckResponse {
    pub allowed: bool,
    pub datastore_query_count: u32,
    pub dispatch_count: u32,
    pub cycle_detected: bool,
}

/// Expand a relation on an object into a userset tree.
#[derive(Debug, Clone)]
pub struct ExpandApiRequest {
    pub store_id: String,
    pub authorization_model_id: Option<String>,
    pub object: String,
    pub relation: String,
    pub consistency: ConsistencyPreference,
}

#[derive(Debug, Clone)]
pub struct ExpandApiResponse {
    pub tree: UsersetTree,
}

/// ListObjects: which objects of a type is the user related to?
#[derive(Debug, Clone)]
pub struct ListObjectsApiRequest {
    pub store_id: String,
    pub authorization_model_id: Option<String>,
    pub object_type: String,
    pub relation: String,
    pub user: String,
    pub contextual_tuples: Vec<ContextualTuple>,
    pub context: HashMap<String, serde_json::Value>,
    pub consistency: ConsistencyPreference,
}

#[derive(Debug, Clone)]
pub struct ListObjectsApiResponse {
    pub objects: Vec<String>,
}

/// ListUsers: which users of a type relate to the object?
#[derive(Debug, Clone)]
pub struct ListUsersApiRequest {
    pub store_id: String,
    pub authorization_model_id: Option<String>,
    pub object: String,
    pub relation: String,
    pub user_type_filter: String,
    pub context: HashMap<String, serde_json::Value>,
    pub consistency: ConsistencyPreference,
}

#[derive(Debug, Clone)]
pub struct ListUsersApiResponse {
    pub users: Vec<String>,
}

/// One tuple to write, with its optional condition.
#[derive(Debug, Clone)]
pub struct TupleWrite {
    pub key: TupleKey,
    pub condition_name: Option<String>,
    pub condition_context: Option<HashMap<String, serde_json::Value>>,
}

impl TupleWrite {
    pub fn new(key: TupleKey) -> Self {
        Self {
            key,
            condition_name: None,
            condition_context: None,
        }
    }
}

/// Write: apply tuple writes and deletes atomically.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub store_id: String,
    pub authorization_model_id: Option<String>,
    pub writes: Vec<TupleWrite>,
    pub deletes: Vec<TupleKey>,
}

/// Read: list tuples matching a partial key.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    pub store_id: String,
    /// `type:id` for an exact object, `type:` for all objects of a type.
    pub object: Option<String>,
    pub relation: Option<String>,
    pub user: Option<String>,
    pub page_size: Option<u32>,
    pub continuation_token: Option<String>,
    pub consistency: ConsistencyPreference,
}

#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub tuples: Vec<warden_storage::StoredTuple>,
    pub continuation_token: Option<String>,
}

/// ReadChanges: page through the tuple changelog.
#[derive(Debug, Clone, Default)]
pub struct ReadChangesRequest {
    pub store_id: String,
    pub object_type: Option<String>,
    pub page_size: Option<u32>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadChangesResponse {
    pub changes: Vec<TupleChange>,
    pub continuation_token: Option<String>,
}

/// Store CRUD.
#[derive(Debug, Clone)]
pub struct CreateStoreRequest {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct StoreResponse {
    pub store: Store,
}

#[derive(Debug, Clone, Default)]
pub struct ListStoresRequest {
    pub page_size: Option<u32>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListStoresResponse {
    pub stores: Vec<Store>,
    pub continuation_token: Option<String>,
}

/// Authorization model reads and writes.
#[derive(Debug, Clone)]
pub struct WriteAuthorizationModelRequest {
    pub store_id: String,
    pub schema_version: String,
    pub type_definitions: Vec<TypeDefinition>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone)]
pub struct WriteAuthorizationModelResponse {
    pub authorization_model_id: String,
}

#[derive(Debug, Clone)]
pub struct ReadAuthorizationModelResponse {
    pub authorization_model: AuthorizationModel,
}

#[derive(Debug, Clone, Default)]
pub struct ReadAuthorizationModelsRequest {
    pub store_id: String,
    pub page_size: Option<u32>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadAuthorizationModelsResponse {
    pub authorization_models: Vec<AuthorizationModel>,
    pub continuation_token: Option<String>,
}

/// Assertions attached to a model.
#[derive(Debug, Clone)]
pub struct WriteAssertionsRequest {
    pub store_id: String,
    pub authorization_model_id: Option<String>,
    pub assertions: Vec<Assertion>,
}

#[derive(Debug, Clone)]
pub struct ReadAssertionsResponse {
    pub authorization_model_id: String,
    pub assertions: Vec<Assertion>,
}
