//! Expansion of a relation into a userset tree.
//!
//! Expand is a single-level unfolding of the relation's rewrite: leaves
//! carry the users written directly, references to computed usersets, and
//! the usersets reached through tuple-to-userset edges. Callers expand
//! referenced usersets with further Expand calls.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::DomainResult;
use crate::model::{ObjectRef, TypeSystem, UserRef, Userset};
use crate::reader::RelationshipTupleReader;

/// Type alias for boxed futures to allow async recursion.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request for expanding `(object, relation)` into a tree.
#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub store_id: String,
    pub object: String,
    pub relation: String,
}

/// A node of the expansion tree. Node names are `object#relation`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpandNode {
    Leaf { name: String, leaf: ExpandLeaf },
    Union { name: String, children: Vec<ExpandNode> },
    Intersection { name: String, children: Vec<ExpandNode> },
    Difference {
        name: String,
        base: Box<ExpandNode>,
        subtract: Box<ExpandNode>,
    },
}

impl ExpandNode {
    pub fn name(&self) -> &str {
        match self {
            ExpandNode::Leaf { name, .. }
            | ExpandNode::Union { name, .. }
            | ExpandNode::Intersection { name, .. }
            | ExpandNode::Difference { name, .. } => name,
        }
    }
}

/// Leaf content of the expansion tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpandLeaf {
    /// Users assigned directly, as written (including usersets and
    /// typed wildcards).
    Users(Vec<String>),
    /// A computed userset reference, e.g. `document:1#editor`.
    Computed(String),
    /// Usersets reached by following the tupleset relation, e.g.
    /// `folder:x#viewer` for each parent folder.
    TupleToUserset {
        tupleset: String,
        computed: Vec<String>,
    },
}

/// The expansion tree for one `(object, relation)`.
#[derive(Debug, Clone, PartialEq)]
pub struct UsersetTree {
    pub root: ExpandNode,
}

/// Executes Expand requests against a type system and tuple reader.
pub struct ExpandQuery {
    typesystem: Arc<TypeSystem>,
    tuple_reader: Arc<dyn RelationshipTupleReader>,
}

impl ExpandQuery {
    pub fn new(
        typesystem: Arc<TypeSystem>,
        tuple_reader: Arc<dyn RelationshipTupleReader>,
    ) -> Self {
        Self {
            typesystem,
            tuple_reader,
        }
    }

    pub async fn execute(&self, request: &ExpandRequest) -> DomainResult<UsersetTree> {
        let object = ObjectRef::parse(&request.object)?;
        if request.relation.is_empty() {
            return Err(crate::error::DomainError::InvalidRelationFormat {
                value: request.relation.clone(),
            });
        }

        let relation_def = self
            .typesystem
            .get_relation(&object.object_type, &request.relation)?;

        // One level only: nested set operators recurse structurally, but
        // usersets behind leaves are not followed.
        let root = self
            .expand_rewrite(request, &object, &relation_def.rewrite)
            .await?;
        Ok(UsersetTree { root })
    }

    fn node_name(&self, request: &ExpandRequest) -> String {
        format!("{}#{}", request.object, request.relation)
    }

    fn expand_rewrite<'a>(
        &'a self,
        request: &'a ExpandRequest,
        object: &'a ObjectRef,
        rewrite: &'a Userset,
    ) -> BoxFuture<'a, DomainResult<ExpandNode>> {
        Box::pin(async move {
            let name = self.node_name(request);
            match rewrite {
                Userset::This => {
                    let tuples = self
                        .tuple_reader
                        .read_relation_tuples(
                            &request.store_id,
                            &object.object_type,
                            &object.object_id,
                            &request.relation,
                        )
                        .await?;
                    let mut users: Vec<String> = tuples.iter().map(|t| t.user()).collect();
                    users.sort();
                    users.dedup();
                    Ok(ExpandNode::Leaf {
                        name,
                        leaf: ExpandLeaf::Users(users),
                    })
                }

                Userset::ComputedUserset { relation } => Ok(ExpandNode::Leaf {
                    name,
                    leaf: ExpandLeaf::Computed(format!("{}#{}", request.object, relation)),
                }),

                Userset::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    let tuples = self
                        .tuple_reader
                        .read_relation_tuples(
                            &request.store_id,
                            &object.object_type,
                            &object.object_id,
                            tupleset,
                        )
                        .await?;
                    let mut computed: Vec<String> = tuples
                        .iter()
                        .filter(|t| !matches!(t.user_ref(), UserRef::Wildcard { .. }))
                        .map(|t| {
                            format!("{}:{}#{}", t.user_type, t.user_id, computed_userset)
                        })
                        .collect();
                    computed.sort();
                    computed.dedup();
                    Ok(ExpandNode::Leaf {
                        name,
                        leaf: ExpandLeaf::TupleToUserset {
                            tupleset: format!("{}#{}", request.object, tupleset),
                            computed,
                        },
                    })
                }

                Userset::Union { children } => {
                    let mut nodes = Vec::with_capacity(children.len());
                    for child in children {
                        nodes.push(self.expand_rewrite(request, object, child).await?);
                    }
                    Ok(ExpandNode::Union {
                        name,
                        children: nodes,
                    })
                }

                Userset::Intersection { children } => {
                    let mut nodes = Vec::with_capacity(children.len());
                    for child in children {
                        nodes.push(self.expand_rewrite(request, object, child).await?);
                    }
                    Ok(ExpandNode::Intersection {
                        name,
                        children: nodes,
                    })
                }

                Userset::Exclusion { base, subtract } => {
                    let base = self.expand_rewrite(request, object, base).await?;
                    let subtract = self.expand_rewrite(request, object, subtract).await?;
                    Ok(ExpandNode::Difference {
                        name,
                        base: Box::new(base),
                        subtract: Box::new(subtract),
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AuthorizationModel, RelationDefinition, TypeConstraint, TypeDefinition,
    };
    use crate::reader::test_support::MockTupleReader;

    fn model() -> AuthorizationModel {
        AuthorizationModel {
            id: Some("model-1".to_string()),
            schema_version: "1.1".to_string(),
            type_definitions: vec![
                TypeDefinition {
                    type_name: "user".to_string(),
                    relations: vec![],
                },
                TypeDefinition {
                    type_name: "folder".to_string(),
                    relations: vec![RelationDefinition {
                        name: "viewer".to_string(),
                        rewrite: Userset::This,
                        type_constraints: vec![TypeConstraint::direct("user")],
                        module: None,
                    }],
                },
                TypeDefinition {
                    type_name: "document".to_string(),
                    relations: vec![
                        RelationDefinition {
                            name: "parent".to_string(),
                            rewrite: Userset::This,
                            type_constraints: vec![TypeConstraint::direct("folder")],
                            module: None,
                        },
                        RelationDefinition {
                            name: "editor".to_string(),
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
                                        relation: "editor".to_string(),
                                    },
                                    Userset::TupleToUserset {
                                        tupleset: "parent".to_string(),
                                        computed_userset: "viewer".to_string(),
                                    },
                                ],
                            },
                            type_constraints: vec![TypeConstraint::direct("user")],
                            module: None,
                        },
                    ],
                },
            ],
            conditions: vec![],
        }
    }

    #[tokio::test]
    async fn test_expand_union_tree() {
        let reader = Arc::new(MockTupleReader::new());
        reader.add("document:1", "viewer", "user:anne").await;
        reader.add("document:1", "viewer", "group:eng#member").await;
        reader.add("document:1", "parent", "folder:x").await;

        let query = ExpandQuery::new(Arc::new(TypeSystem::new(model())), reader);
        let tree = query
            .execute(&ExpandRequest {
                store_id: "s".to_string(),
                object: "document:1".to_string(),
                relation: "viewer".to_string(),
            })
            .await
            .unwrap();

        let ExpandNode::Union { name, children } = tree.root else {
            panic!("expected a union root");
        };
        assert_eq!(name, "document:1#viewer");
        assert_eq!(children.len(), 3);

        assert_eq!(
            children[0],
            ExpandNode::Leaf {
                name: "document:1#viewer".to_string(),
                leaf: ExpandLeaf::Users(vec![
                    "group:eng#member".to_string(),
                    "user:anne".to_string(),
                ]),
            }
        );
        assert_eq!(
            children[1],
            ExpandNode::Leaf {
                name: "document:1#viewer".to_string(),
                leaf: ExpandLeaf::Computed("document:1#editor".to_string()),
            }
        );
        assert_eq!(
            children[2],
            ExpandNode::Leaf {
                name: "document:1#viewer".to_string(),
                leaf: ExpandLeaf::TupleToUserset {
                    tupleset: "document:1#parent".to_string(),
                    computed: vec!["folder:x#viewer".to_string()],
                },
            }
        );
    }

    #[tokio::test]
    async fn test_expand_unknown_relation_fails() {
        let reader = Arc::new(MockTupleReader::new());
        let query = ExpandQuery::new(Arc::new(TypeSystem::new(model())), reader);
        assert!(query
            .execute(&ExpandRequest {
                store_id: "s".to_string(),
                object: "document:1".to_string(),
                relation: "nonexistent".to_string(),
            })
            .await
            .is_err());
    }
}
