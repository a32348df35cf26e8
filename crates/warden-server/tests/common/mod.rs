//! Shared helpers for server integration tests.
//!
//! Each test binary uses the subset it needs.
#![allow(dead_code)]

use std::sync::Arc;

use warden_domain::model::{
    Condition, RelationDefinition, TupleKey, TypeConstraint, TypeDefinition, Userset,
};
use warden_server::types::{CreateStoreRequest, TupleWrite, WriteAuthorizationModelRequest, WriteRequest};
use warden_server::{RequestContext, Server, ServerConfig};
use warden_storage::{DataStore, MemoryDataStore};

pub struct TestEnv {
    pub server: Server,
    pub datastore: Arc<dyn DataStore>,
}

/// Builds a server over a fresh in-memory datastore.
pub fn server_with_config(config: ServerConfig) -> TestEnv {
    let datastore: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
    let server = Server::new(config, Arc::clone(&datastore)).expect("server construction");
    TestEnv { server, datastore }
}

pub fn server() -> TestEnv {
    server_with_config(ServerConfig::default())
}

/// Creates a store and writes a model; returns (store_id, model_id).
pub async fn bootstrap(
    env: &TestEnv,
    type_definitions: Vec<TypeDefinition>,
    conditions: Vec<Condition>,
) -> (String, String) {
    let ctx = RequestContext::anonymous();
    let store = env
        .server
        .create_store(
            &ctx,
            CreateStoreRequest {
                name: "test-store".to_string(),
            },
        )
        .await
        .expect("create store");

    let model = env
        .server
        .write_authorization_model(
            &ctx,
            WriteAuthorizationModelRequest {
                store_id: store.store.id.clone(),
                schema_version: "1.1".to_string(),
                type_definitions,
                conditions,
            },
        )
        .await
        .expect("write model");

    (store.store.id, model.authorization_model_id)
}

/// Writes tuples given as (object, relation, user) triples.
pub async fn write_tuples(env: &TestEnv, store_id: &str, tuples: &[(&str, &str, &str)]) {
    let ctx = RequestContext::anonymous();
    env.server
        .write(
            &ctx,
            WriteRequest {
                store_id: store_id.to_string(),
                authorization_model_id: None,
                writes: tuples
                    .iter()
                    .map(|(object, relation, user)| {
                        TupleWrite::new(TupleKey::new(*object, *relation, *user))
                    })
                    .collect(),
                deletes: vec![],
            },
        )
        .await
        .expect("write tuples");
}

pub fn relation(name: &str, rewrite: Userset, constraints: Vec<TypeConstraint>) -> RelationDefinition {
    RelationDefinition {
        name: name.to_string(),
        rewrite,
        type_constraints: constraints,
        module: None,
    }
}

pub fn type_def(name: &str, relations: Vec<RelationDefinition>) -> TypeDefinition {
    TypeDefinition {
        type_name: name.to_string(),
        relations,
    }
}

/// `type user` plus `type document` with `viewer: [user]`.
pub fn direct_viewer_types() -> Vec<TypeDefinition> {
    vec![
        type_def("user", vec![]),
        type_def(
            "document",
            vec![relation(
                "viewer",
                Userset::This,
                vec![TypeConstraint::direct("user")],
            )],
        ),
    ]
}

/// The meta-model used by self-authorization tests.
pub fn authz_meta_types() -> Vec<TypeDefinition> {
    let app = TypeConstraint::direct("application");
    let store_relations = vec![
        relation("admin", Userset::This, vec![app.clone()]),
        relation(
            "can_call_check",
            Userset::Union {
                children: vec![
                    Userset::This,
                    Userset::ComputedUserset {
                        relation: "admin".to_string(),
                    },
                ],
            },
            vec![app.clone()],
        ),
        relation(
            "can_call_get_store",
            Userset::Union {
                children: vec![
                    Userset::This,
                    Userset::ComputedUserset {
                        relation: "admin".to_string(),
                    },
                ],
            },
            vec![app.clone()],
        ),
        relation(
            "can_call_write",
            Userset::Union {
                children: vec![
                    Userset::This,
                    Userset::ComputedUserset {
                        relation: "admin".to_string(),
                    },
                ],
            },
            vec![app.clone()],
        ),
    ];

    vec![
        type_def("application", vec![]),
        type_def(
            "system",
            vec![relation(
                "can_call_create_stores",
                Userset::This,
                vec![app.clone()],
            )],
        ),
        type_def("store", store_relations),
        type_def(
            "module",
            vec![relation("can_call_write", Userset::This, vec![app])],
        ),
    ]
}

