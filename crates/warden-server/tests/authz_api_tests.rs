//! Self-authorization (FGA-on-FGA) behavior through the server facade.
//!
//! A meta-store holds the tuples describing which applications may call
//! which API methods; the server gates every call on a check against it.

mod common;

use common::*;

use warden_domain::model::{RelationDefinition, TupleKey, Userset};
use warden_server::config::{EXPERIMENTAL_ENABLE_FGA_ON_FGA, ServerConfig};
use warden_server::types::{CheckRequest, CreateStoreRequest, ListStoresRequest, TupleWrite, WriteRequest};
use warden_server::{RequestContext, ServerError};

const CLIENT_ID: &str = "01-client-aardvark";

/// Bootstraps a server whose authorizer points at a meta-store, then
/// creates a working store the tests operate on.
///
/// Returns (env, meta_store_id, work_store_id).
async fn authz_env(work_types: Vec<warden_domain::model::TypeDefinition>) -> (TestEnv, String, String) {
    // First, an ungated server to set up the meta-store.
    let setup = server();
    let (meta_store_id, meta_model_id) = bootstrap(&setup, authz_meta_types(), vec![]).await;

    // Now the gated server over the same datastore.
    let mut config = ServerConfig::default();
    config.experimentals.push(EXPERIMENTAL_ENABLE_FGA_ON_FGA.to_string());
    config.fga_on_fga.enabled = true;
    config.fga_on_fga.store_id = meta_store_id.clone();
    config.fga_on_fga.model_id = meta_model_id;
    let server =
        warden_server::Server::new(config, std::sync::Arc::clone(&setup.datastore)).unwrap();
    let env = TestEnv {
        server,
        datastore: setup.datastore,
    };

    // The working store is created through the ungated setup server.
    let ctx = RequestContext::anonymous();
    let store = setup
        .server
        .create_store(
            &ctx,
            CreateStoreRequest {
                name: "work-store".to_string(),
            },
        )
        .await
        .unwrap();
    let work_store_id = store.store.id;
    setup
        .server
        .write_authorization_model(
            &ctx,
            warden_server::types::WriteAuthorizationModelRequest {
                store_id: work_store_id.clone(),
                schema_version: "1.1".to_string(),
                type_definitions: work_types,
                conditions: vec![],
            },
        )
        .await
        .unwrap();

    (env, meta_store_id, work_store_id)
}

/// Grants `relation` on the working store to the test client in the
/// meta-store.
async fn grant(env: &TestEnv, meta_store_id: &str, object: &str, relation: &str) {
    let ctx = RequestContext::anonymous().skipping_authz();
    env.server
        .write(
            &ctx,
            WriteRequest {
                store_id: meta_store_id.to_string(),
                authorization_model_id: None,
                writes: vec![TupleWrite::new(TupleKey::new(
                    object,
                    relation,
                    format!("application:{}", CLIENT_ID),
                ))],
                deletes: vec![],
            },
        )
        .await
        .unwrap();
}

fn work_check(store_id: &str) -> CheckRequest {
    CheckRequest::new(
        store_id,
        TupleKey::new("document:1", "viewer", "user:anne"),
    )
}

#[tokio::test]
async fn test_check_requires_meta_grant() {
    let (env, meta_store_id, work_store_id) = authz_env(direct_viewer_types()).await;
    let ctx = RequestContext::with_client_id(CLIENT_ID);

    // Without the grant: permission denied with the stable message.
    let err = env
        .server
        .check(&ctx, work_check(&work_store_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PermissionDenied));
    assert_eq!(err.to_string(), "permission denied");

    // With the grant: the check executes (and is simply false).
    grant(
        &env,
        &meta_store_id,
        &format!("store:{}", work_store_id),
        "can_call_check",
    )
    .await;
    let response = env
        .server
        .check(&ctx, work_check(&work_store_id))
        .await
        .unwrap();
    assert!(!response.allowed);
}

#[tokio::test]
async fn test_admin_grants_all_mapped_relations() {
    let (env, meta_store_id, work_store_id) = authz_env(direct_viewer_types()).await;
    let ctx = RequestContext::with_client_id(CLIENT_ID);

    grant(
        &env,
        &meta_store_id,
        &format!("store:{}", work_store_id),
        "admin",
    )
    .await;

    // admin implies can_call_check and can_call_get_store in the meta-model.
    assert!(env.server.check(&ctx, work_check(&work_store_id)).await.is_ok());
    assert!(env.server.get_store(&ctx, &work_store_id).await.is_ok());
}

#[tokio::test]
async fn test_missing_or_empty_client_id_is_internal() {
    let (env, _meta_store_id, work_store_id) = authz_env(direct_viewer_types()).await;

    let err = env
        .server
        .check(&RequestContext::anonymous(), work_check(&work_store_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ClientIdNotFound));
    assert_eq!(err.to_string(), "client ID not found in context");

    let err = env
        .server
        .check(&RequestContext::with_client_id(""), work_check(&work_store_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::ClientIdNotFound));
}

#[tokio::test]
async fn test_skip_authz_bypasses_the_gate() {
    let (env, _meta_store_id, work_store_id) = authz_env(direct_viewer_types()).await;

    // No claims, no grants, but the skip flag is set.
    let ctx = RequestContext::anonymous().skipping_authz();
    assert!(env.server.check(&ctx, work_check(&work_store_id)).await.is_ok());
}

#[tokio::test]
async fn test_create_store_gated_by_system_object() {
    let (env, meta_store_id, _work_store_id) = authz_env(direct_viewer_types()).await;
    let ctx = RequestContext::with_client_id(CLIENT_ID);

    let err = env
        .server
        .create_store(
            &ctx,
            CreateStoreRequest {
                name: "new-store".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PermissionDenied));

    grant(&env, &meta_store_id, "system:fga", "can_call_create_stores").await;
    assert!(env
        .server
        .create_store(
            &ctx,
            CreateStoreRequest {
                name: "new-store".to_string(),
            },
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn test_list_stores_filters_to_accessible_set() {
    let (env, meta_store_id, work_store_id) = authz_env(direct_viewer_types()).await;
    let ctx = RequestContext::with_client_id(CLIENT_ID);

    // No grants: the page filters down to nothing rather than erroring.
    let empty = env
        .server
        .list_stores(&ctx, ListStoresRequest::default())
        .await
        .unwrap();
    assert!(empty.stores.is_empty());

    grant(
        &env,
        &meta_store_id,
        &format!("store:{}", work_store_id),
        "can_call_get_store",
    )
    .await;
    let listed = env
        .server
        .list_stores(&ctx, ListStoresRequest::default())
        .await
        .unwrap();
    assert_eq!(listed.stores.len(), 1);
    assert_eq!(listed.stores[0].id, work_store_id);
}

#[tokio::test]
async fn test_modular_write_checks_modules() {
    // A working model whose relations carry module metadata.
    let work_types = vec![
        type_def("user", vec![]),
        type_def(
            "document",
            vec![RelationDefinition {
                name: "viewer".to_string(),
                rewrite: Userset::This,
                type_constraints: vec![warden_domain::model::TypeConstraint::direct("user")],
                module: Some("docs".to_string()),
            }],
        ),
    ];
    let (env, meta_store_id, work_store_id) = authz_env(work_types).await;
    let ctx = RequestContext::with_client_id(CLIENT_ID);

    let write = WriteRequest {
        store_id: work_store_id.clone(),
        authorization_model_id: None,
        writes: vec![TupleWrite::new(TupleKey::new(
            "document:1",
            "viewer",
            "user:anne",
        ))],
        deletes: vec![],
    };

    // A store-level write grant is not enough for a modular model.
    grant(
        &env,
        &meta_store_id,
        &format!("store:{}", work_store_id),
        "can_call_write",
    )
    .await;
    assert!(matches!(
        env.server.write(&ctx, write.clone()).await.unwrap_err(),
        ServerError::PermissionDenied
    ));

    // The module-level grant admits the write.
    grant(
        &env,
        &meta_store_id,
        &format!("module:{}/docs", work_store_id),
        "can_call_write",
    )
    .await;
    assert!(env.server.write(&ctx, write).await.is_ok());
}
