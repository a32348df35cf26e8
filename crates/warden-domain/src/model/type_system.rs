//! Type system for authorization model lookups with caching.
//!
//! The `TypeSystem` answers relation-shape questions for one resolved
//! model: which rewrite a relation has, which user types are directly
//! assignable, which module a relation belongs to, and which conditions
//! exist. Lookups are cached in `DashMap`s for concurrent access.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use moka::sync::Cache;

use crate::error::{DomainError, DomainResult};

use super::types::{
    AuthorizationModel, Condition, ContextualTuple, RelationDefinition, TupleKey, TypeConstraint,
    TypeDefinition, ObjectRef, UserRef, Userset,
};

/// Type system providing cached access to one authorization model.
///
/// Thread-safe; intended to be shared as `Arc<TypeSystem>` across the
/// tasks of a request.
#[derive(Debug)]
pub struct TypeSystem {
    /// The underlying authorization model.
    model: Arc<AuthorizationModel>,
    /// Cache for type definitions, keyed by type name.
    type_cache: DashMap<String, Arc<TypeDefinition>>,
    /// Cache for relation definitions, keyed by "type_name#relation_name".
    relation_cache: DashMap<String, Arc<RelationDefinition>>,
}

impl TypeSystem {
    /// Creates a new `TypeSystem` from an authorization model.
    ///
    /// Lookups are cached lazily as they are accessed.
    pub fn new(model: AuthorizationModel) -> Self {
        Self {
            model: Arc::new(model),
            type_cache: DashMap::new(),
            relation_cache: DashMap::new(),
        }
    }

    /// Returns a reference to the underlying authorization model.
    pub fn model(&self) -> &AuthorizationModel {
        &self.model
    }

    /// The resolved model id, empty if the model was never persisted.
    pub fn authorization_model_id(&self) -> &str {
        self.model.id.as_deref().unwrap_or("")
    }

    /// Gets a type definition by name.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TypeNotFound` if the type does not exist.
    pub fn get_type(&self, type_name: &str) -> DomainResult<Arc<TypeDefinition>> {
        if let Some(cached) = self.type_cache.get(type_name) {
            return Ok(Arc::clone(cached.value()));
        }

        let type_def = self
            .model
            .type_definitions
            .iter()
            .find(|td| td.type_name == type_name)
            .ok_or_else(|| DomainError::TypeNotFound {
                type_name: type_name.to_string(),
            })?;

        let type_def_arc = Arc::new(type_def.clone());
        self.type_cache
            .insert(type_name.to_string(), Arc::clone(&type_def_arc));
        Ok(type_def_arc)
    }

    /// Gets a relation definition for a specific type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TypeNotFound` if the type does not exist.
    /// Returns `DomainError::RelationNotFound` if the relation does not
    /// exist on the type.
    pub fn get_relation(
        &self,
        type_name: &str,
        relation: &str,
    ) -> DomainResult<Arc<RelationDefinition>> {
        let cache_key = format!("{}#{}", type_name, relation);

        if let Some(cached) = self.relation_cache.get(&cache_key) {
            return Ok(Arc::clone(cached.value()));
        }

        let type_def = self.get_type(type_name)?;

        let relation_def = type_def
            .relations
            .iter()
            .find(|r| r.name == relation)
            .ok_or_else(|| DomainError::RelationNotFound {
                type_name: type_name.to_string(),
                relation: relation.to_string(),
            })?;

        let relation_def_arc = Arc::new(relation_def.clone());
        self.relation_cache
            .insert(cache_key, Arc::clone(&relation_def_arc));
        Ok(relation_def_arc)
    }

    /// Checks if a type exists in the model.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.get_type(type_name).is_ok()
    }

    /// Checks if a relation exists on a type.
    pub fn has_relation(&self, type_name: &str, relation: &str) -> bool {
        self.get_relation(type_name, relation).is_ok()
    }

    /// The directly-related user types allowed on (type, relation).
    pub fn direct_type_restrictions(
        &self,
        type_name: &str,
        relation: &str,
    ) -> DomainResult<Vec<TypeConstraint>> {
        Ok(self.get_relation(type_name, relation)?.type_constraints.clone())
    }

    /// Looks up a condition definition by name.
    pub fn get_condition(&self, name: &str) -> DomainResult<Condition> {
        self.model
            .find_condition(name)
            .cloned()
            .ok_or_else(|| DomainError::ConditionNotFound {
                condition_name: name.to_string(),
            })
    }

    /// The module a (type, relation) pair belongs to, if any.
    pub fn module_for(&self, type_name: &str, relation: &str) -> DomainResult<Option<String>> {
        Ok(self.get_relation(type_name, relation)?.module.clone())
    }

    /// Validates a check tuple key: the object's type and relation must
    /// exist, and a userset user must name an existing relation.
    pub fn validate_check_key(&self, key: &TupleKey) -> DomainResult<()> {
        key.validate_format()?;

        let object = ObjectRef::parse(&key.object)?;
        self.get_relation(&object.object_type, &key.relation)?;

        if let UserRef::Userset {
            user_type,
            relation,
            ..
        } = UserRef::parse(&key.user)?
        {
            self.get_relation(&user_type, &relation)?;
        }

        Ok(())
    }

    /// Validates a tuple for writing (or a contextual tuple).
    ///
    /// Beyond the check-key validation, the user side must satisfy one of
    /// the relation's direct type restrictions, and any referenced
    /// condition must exist in the model.
    pub fn validate_write_tuple(
        &self,
        key: &TupleKey,
        condition_name: Option<&str>,
    ) -> DomainResult<()> {
        key.validate_format()?;

        let object = ObjectRef::parse(&key.object)?;
        let relation_def = self.get_relation(&object.object_type, &key.relation)?;
        let user = UserRef::parse(&key.user)?;

        if !self.has_type(user.user_type()) {
            return Err(DomainError::TypeNotFound {
                type_name: user.user_type().to_string(),
            });
        }
        if let UserRef::Userset {
            user_type,
            relation,
            ..
        } = &user
        {
            self.get_relation(user_type, relation)?;
        }

        let satisfied = relation_def.type_constraints.iter().any(|tc| match &user {
            UserRef::Object { user_type, .. } => {
                tc.type_name == *user_type && tc.relation.is_none()
            }
            UserRef::Wildcard { user_type } => tc.type_name == *user_type && tc.wildcard,
            UserRef::Userset {
                user_type,
                relation,
                ..
            } => tc.type_name == *user_type && tc.relation.as_deref() == Some(relation),
        });
        if !satisfied {
            return Err(DomainError::TupleValidationError {
                message: format!(
                    "user '{}' is not assignable to relation '{}' on type '{}'",
                    key.user, key.relation, object.object_type
                ),
            });
        }

        if let Some(name) = condition_name {
            self.get_condition(name)?;
        }

        Ok(())
    }

    /// Validates a contextual tuple the same way a write is validated.
    pub fn validate_contextual_tuple(&self, tuple: &ContextualTuple) -> DomainResult<()> {
        self.validate_write_tuple(&tuple.key, tuple.condition_name.as_deref())
    }

    /// Validates the authorization model semantically: every relation
    /// referenced by a rewrite or type constraint must exist.
    pub fn validate_model(&self) -> DomainResult<()> {
        let mut errors = Vec::new();

        for type_def in &self.model.type_definitions {
            for relation_def in &type_def.relations {
                self.validate_userset(
                    &type_def.type_name,
                    &relation_def.name,
                    &relation_def.rewrite,
                    &mut errors,
                );
                for tc in &relation_def.type_constraints {
                    if !self.has_type(&tc.type_name) {
                        errors.push(format!(
                            "type '{}' relation '{}': restriction references non-existent type '{}'",
                            type_def.type_name, relation_def.name, tc.type_name
                        ));
                    } else if let Some(ref rel) = tc.relation {
                        if !self.has_relation(&tc.type_name, rel) {
                            errors.push(format!(
                                "type '{}' relation '{}': restriction references non-existent relation '{}#{}'",
                                type_def.type_name, relation_def.name, tc.type_name, rel
                            ));
                        }
                    }
                    if let Some(ref condition) = tc.condition {
                        if self.model.find_condition(condition).is_none() {
                            errors.push(format!(
                                "type '{}' relation '{}': restriction references non-existent condition '{}'",
                                type_def.type_name, relation_def.name, condition
                            ));
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DomainError::ModelValidationError {
                message: errors.join("; "),
            })
        }
    }

    fn validate_userset(
        &self,
        type_name: &str,
        relation_name: &str,
        userset: &Userset,
        errors: &mut Vec<String>,
    ) {
        match userset {
            Userset::This => {}
            Userset::ComputedUserset { relation } => {
                if !self.has_relation(type_name, relation) {
                    errors.push(format!(
                        "type '{}' relation '{}': computed userset references non-existent relation '{}'",
                        type_name, relation_name, relation
                    ));
                }
            }
            Userset::TupleToUserset { tupleset, .. } => {
                // The computed userset lives on the tupleset's target types,
                // which are only known from tuples at evaluation time.
                if !self.has_relation(type_name, tupleset) {
                    errors.push(format!(
                        "type '{}' relation '{}': tupleset references non-existent relation '{}'",
                        type_name, relation_name, tupleset
                    ));
                }
            }
            Userset::Union { children } | Userset::Intersection { children } => {
                for child in children {
                    self.validate_userset(type_name, relation_name, child, errors);
                }
            }
            Userset::Exclusion { base, subtract } => {
                self.validate_userset(type_name, relation_name, base, errors);
                self.validate_userset(type_name, relation_name, subtract, errors);
            }
        }
    }
}

/// Read access to persisted authorization models, as the type-system
/// resolver consumes it. Implemented over the datastore by the server.
#[async_trait]
pub trait AuthorizationModelReader: Send + Sync {
    /// Reads a model by id, or the store's latest model when `model_id`
    /// is `None`. The returned model must have its `id` populated.
    async fn read_model(
        &self,
        store_id: &str,
        model_id: Option<&str>,
    ) -> DomainResult<AuthorizationModel>;
}

/// Resolves `(store_id, model_id?)` to a shared `TypeSystem`.
///
/// Exact-id resolutions are memoized in a size-bounded cache; models are
/// immutable, so entries never go stale. Latest-model resolutions always
/// consult the reader so new models are picked up immediately.
pub struct TypesystemResolver {
    reader: Arc<dyn AuthorizationModelReader>,
    by_model_id: Cache<(String, String), Arc<TypeSystem>>,
}

impl TypesystemResolver {
    pub fn new(reader: Arc<dyn AuthorizationModelReader>, cache_size: u64) -> Self {
        Self {
            reader,
            by_model_id: Cache::builder().max_capacity(cache_size).build(),
        }
    }

    /// Resolves the type system for a store and optional model id.
    pub async fn resolve(
        &self,
        store_id: &str,
        model_id: Option<&str>,
    ) -> DomainResult<Arc<TypeSystem>> {
        if let Some(model_id) = model_id {
            let key = (store_id.to_string(), model_id.to_string());
            if let Some(cached) = self.by_model_id.get(&key) {
                return Ok(cached);
            }

            let model = self.reader.read_model(store_id, Some(model_id)).await?;
            let typesystem = Arc::new(TypeSystem::new(model));
            self.by_model_id.insert(key, Arc::clone(&typesystem));
            return Ok(typesystem);
        }

        let model = self.reader.read_model(store_id, None).await?;
        let resolved_id = model.id.clone();
        let typesystem = Arc::new(TypeSystem::new(model));
        if let Some(id) = resolved_id {
            self.by_model_id
                .insert((store_id.to_string(), id), Arc::clone(&typesystem));
        }
        Ok(typesystem)
    }

    /// Drops all memoized type systems.
    pub fn clear(&self) {
        self.by_model_id.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_model() -> AuthorizationModel {
        AuthorizationModel {
            id: Some("01MODEL".to_string()),
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
                            name: "owner".to_string(),
                            rewrite: Userset::This,
                            type_constraints: vec![TypeConstraint::direct("user")],
                            module: None,
                        },
                        RelationDefinition {
                            name: "viewer".to_string(),
                            rewrite: Userset::Union {
                                children: vec![
                                    Userset::This,
                                    Userset::ComputedUserset {
                                        relation: "owner".to_string(),
                                    },
                                ],
                            },
                            type_constraints: vec![
                                TypeConstraint::direct("user"),
                                TypeConstraint::wildcard("user"),
                                TypeConstraint::userset("group", "member"),
                            ],
                            module: Some("docs".to_string()),
                        },
                    ],
                },
                TypeDefinition {
                    type_name: "group".to_string(),
                    relations: vec![RelationDefinition {
                        name: "member".to_string(),
                        rewrite: Userset::This,
                        type_constraints: vec![TypeConstraint::direct("user")],
                        module: None,
                    }],
                },
            ],
            conditions: vec![Condition {
                name: "in_window".to_string(),
                expression: "current_time < expires_at".to_string(),
                parameters: Default::default(),
            }],
        }
    }

    #[test]
    fn test_get_type_and_relation() {
        let ts = TypeSystem::new(create_test_model());

        let doc = ts.get_type("document").unwrap();
        assert_eq!(doc.relations.len(), 2);

        let viewer = ts.get_relation("document", "viewer").unwrap();
        assert_eq!(viewer.name, "viewer");

        assert!(matches!(
            ts.get_relation("document", "nope").unwrap_err(),
            DomainError::RelationNotFound { .. }
        ));
        assert!(matches!(
            ts.get_type("nope").unwrap_err(),
            DomainError::TypeNotFound { .. }
        ));
    }

    #[test]
    fn test_lookup_caching() {
        let ts = TypeSystem::new(create_test_model());
        let _ = ts.get_relation("document", "viewer").unwrap();
        let _ = ts.get_relation("document", "viewer").unwrap();
        assert_eq!(ts.relation_cache.len(), 1);
    }

    #[test]
    fn test_module_lookup() {
        let ts = TypeSystem::new(create_test_model());
        assert_eq!(
            ts.module_for("document", "viewer").unwrap(),
            Some("docs".to_string())
        );
        assert_eq!(ts.module_for("document", "owner").unwrap(), None);
    }

    #[test]
    fn test_validate_write_tuple_restrictions() {
        let ts = TypeSystem::new(create_test_model());

        assert!(ts
            .validate_write_tuple(
                &TupleKey::new("document:readme", "viewer", "user:alice"),
                None
            )
            .is_ok());
        assert!(ts
            .validate_write_tuple(&TupleKey::new("document:readme", "viewer", "user:*"), None)
            .is_ok());
        assert!(ts
            .validate_write_tuple(
                &TupleKey::new("document:readme", "viewer", "group:eng#member"),
                None
            )
            .is_ok());

        // owner does not allow wildcards
        assert!(matches!(
            ts.validate_write_tuple(&TupleKey::new("document:readme", "owner", "user:*"), None)
                .unwrap_err(),
            DomainError::TupleValidationError { .. }
        ));
        // group:eng (without #member) is not an allowed viewer type
        assert!(ts
            .validate_write_tuple(
                &TupleKey::new("document:readme", "viewer", "group:eng"),
                None
            )
            .is_err());
    }

    #[test]
    fn test_validate_write_tuple_unknown_condition() {
        let ts = TypeSystem::new(create_test_model());
        assert!(matches!(
            ts.validate_write_tuple(
                &TupleKey::new("document:readme", "viewer", "user:alice"),
                Some("missing_condition")
            )
            .unwrap_err(),
            DomainError::ConditionNotFound { .. }
        ));
        assert!(ts
            .validate_write_tuple(
                &TupleKey::new("document:readme", "viewer", "user:alice"),
                Some("in_window")
            )
            .is_ok());
    }

    #[test]
    fn test_validate_model_detects_bad_references() {
        let mut model = create_test_model();
        model.type_definitions[1].relations[1].rewrite = Userset::ComputedUserset {
            relation: "ghost".to_string(),
        };
        let ts = TypeSystem::new(model);
        let err = ts.validate_model().unwrap_err();
        assert!(matches!(err, DomainError::ModelValidationError { message } if message.contains("ghost")));
    }

    #[test]
    fn test_validate_model_ok() {
        let ts = TypeSystem::new(create_test_model());
        assert!(ts.validate_model().is_ok());
    }

    struct StaticModelReader(AuthorizationModel);

    #[async_trait]
    impl AuthorizationModelReader for StaticModelReader {
        async fn read_model(
            &self,
            _store_id: &str,
            _model_id: Option<&str>,
        ) -> DomainResult<AuthorizationModel> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_typesystem_resolver_memoizes_exact_ids() {
        let resolver = TypesystemResolver::new(
            Arc::new(StaticModelReader(create_test_model())),
            16,
        );

        let first = resolver.resolve("store-1", Some("01MODEL")).await.unwrap();
        let second = resolver.resolve("store-1", Some("01MODEL")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.authorization_model_id(), "01MODEL");
    }
}
