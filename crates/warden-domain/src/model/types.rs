//! Core type definitions for the authorization model.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// An object reference split into its `type:id` parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }

    /// Parses an object from `type:id` format.
    pub fn parse(value: &str) -> DomainResult<Self> {
        match value.split_once(':') {
            Some((object_type, object_id)) if !object_type.is_empty() && !object_id.is_empty() => {
                Ok(Self::new(object_type, object_id))
            }
            _ => Err(DomainError::InvalidObjectFormat {
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// The user side of a tuple, parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    /// A concrete user object, e.g. `user:alice`.
    Object { user_type: String, user_id: String },
    /// A typed wildcard, e.g. `user:*`.
    Wildcard { user_type: String },
    /// A userset reference, e.g. `group:eng#member`.
    Userset {
        user_type: String,
        user_id: String,
        relation: String,
    },
}

impl UserRef {
    /// Parses a user from `type:id`, `type:*`, or `type:id#relation` format.
    pub fn parse(value: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidUserFormat {
            value: value.to_string(),
        };

        let (object_part, relation) = match value.split_once('#') {
            Some((object_part, relation)) => {
                if relation.is_empty() {
                    return Err(invalid());
                }
                (object_part, Some(relation))
            }
            None => (value, None),
        };

        let (user_type, user_id) = object_part.split_once(':').ok_or_else(invalid)?;
        if user_type.is_empty() || user_id.is_empty() {
            return Err(invalid());
        }

        Ok(match (user_id, relation) {
            ("*", None) => UserRef::Wildcard {
                user_type: user_type.to_string(),
            },
            ("*", Some(_)) => return Err(invalid()),
            (_, None) => UserRef::Object {
                user_type: user_type.to_string(),
                user_id: user_id.to_string(),
            },
            (_, Some(relation)) => UserRef::Userset {
                user_type: user_type.to_string(),
                user_id: user_id.to_string(),
                relation: relation.to_string(),
            },
        })
    }

    /// The type portion of the user.
    pub fn user_type(&self) -> &str {
        match self {
            UserRef::Object { user_type, .. }
            | UserRef::Wildcard { user_type }
            | UserRef::Userset { user_type, .. } => user_type,
        }
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRef::Object { user_type, user_id } => write!(f, "{}:{}", user_type, user_id),
            UserRef::Wildcard { user_type } => write!(f, "{}:*", user_type),
            UserRef::Userset {
                user_type,
                user_id,
                relation,
            } => write!(f, "{}:{}#{}", user_type, user_id, relation),
        }
    }
}

/// A (object, relation, user) key as submitted in requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleKey {
    /// The object identifier, `type:id`.
    pub object: String,
    /// The relation name.
    pub relation: String,
    /// The user identifier: `type:id`, `type:*`, or `type:id#relation`.
    pub user: String,
}

impl TupleKey {
    pub fn new(
        object: impl Into<String>,
        relation: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            relation: relation.into(),
            user: user.into(),
        }
    }

    /// Validates the structural format of all three parts.
    pub fn validate_format(&self) -> DomainResult<()> {
        ObjectRef::parse(&self.object)?;
        if self.relation.is_empty() {
            return Err(DomainError::InvalidRelationFormat {
                value: self.relation.clone(),
            });
        }
        UserRef::parse(&self.user)?;
        Ok(())
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)
    }
}

/// A contextual tuple supplied with a request, visible only for that request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextualTuple {
    pub key: TupleKey,
    /// Optional condition name that must be satisfied for this tuple.
    pub condition_name: Option<String>,
    /// Optional condition parameters as JSON key-value pairs.
    pub condition_context: Option<HashMap<String, serde_json::Value>>,
}

impl ContextualTuple {
    pub fn new(key: TupleKey) -> Self {
        Self {
            key,
            condition_name: None,
            condition_context: None,
        }
    }

    pub fn with_condition(
        key: TupleKey,
        condition_name: impl Into<String>,
        condition_context: Option<HashMap<String, serde_json::Value>>,
    ) -> Self {
        Self {
            key,
            condition_name: Some(condition_name.into()),
            condition_context,
        }
    }
}

/// An authorization model defining types and their relations.
///
/// Models are immutable once written; a store's newest model is its
/// current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationModel {
    /// The model id (ULID), if persisted.
    pub id: Option<String>,
    /// Schema version (e.g., "1.1").
    pub schema_version: String,
    /// Type definitions in the model.
    pub type_definitions: Vec<TypeDefinition>,
    /// Named conditions referenced by tuples and type constraints.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl AuthorizationModel {
    /// Looks up a condition definition by name.
    pub fn find_condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }
}

/// A type definition within the authorization model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
    /// The type name (e.g., "document", "folder").
    #[serde(rename = "type")]
    pub type_name: String,
    /// Relations defined on this type.
    pub relations: Vec<RelationDefinition>,
}

/// A relation definition on a type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    /// The relation name.
    pub name: String,
    /// The userset rewrite for this relation.
    pub rewrite: Userset,
    /// Directly related user types allowed on the user side of tuples
    /// for this relation.
    #[serde(default)]
    pub type_constraints: Vec<TypeConstraint>,
    /// Optional module this relation belongs to, used by modular write
    /// authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

/// A directly-related user type allowed on a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeConstraint {
    /// The allowed user type.
    pub type_name: String,
    /// Set for userset constraints, e.g. `group#member`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    /// Whether the typed wildcard (`type:*`) is assignable.
    #[serde(default)]
    pub wildcard: bool,
    /// Condition that tuples assigned under this constraint must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl TypeConstraint {
    pub fn direct(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
            wildcard: false,
            condition: None,
        }
    }

    pub fn wildcard(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
            wildcard: true,
            condition: None,
        }
    }

    pub fn userset(type_name: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: Some(relation.into()),
            wildcard: false,
            condition: None,
        }
    }
}

/// A userset defines how a relation is computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Userset {
    /// Direct assignment (this).
    This,
    /// Computed userset from another relation on the same object.
    ComputedUserset { relation: String },
    /// Tuple to userset (relation from parent).
    TupleToUserset {
        tupleset: String,
        computed_userset: String,
    },
    /// Union of multiple usersets.
    Union { children: Vec<Userset> },
    /// Intersection of multiple usersets.
    Intersection { children: Vec<Userset> },
    /// Exclusion (base but not subtract).
    Exclusion {
        base: Box<Userset>,
        subtract: Box<Userset>,
    },
}

impl Userset {
    /// Whether any node of this rewrite tree is an intersection or exclusion.
    ///
    /// Relations containing either cannot be proven by reverse expansion
    /// alone; candidates must be confirmed through a check.
    pub fn has_intersection_or_exclusion(&self) -> bool {
        match self {
            Userset::This
            | Userset::ComputedUserset { .. }
            | Userset::TupleToUserset { .. } => false,
            Userset::Union { children } => {
                children.iter().any(Userset::has_intersection_or_exclusion)
            }
            Userset::Intersection { .. } | Userset::Exclusion { .. } => true,
        }
    }
}

/// A named condition: a CEL expression over declared parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    /// The CEL expression source.
    pub expression: String,
    /// Declared parameter names and their type hints.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_parse() {
        let obj = ObjectRef::parse("document:readme").unwrap();
        assert_eq!(obj.object_type, "document");
        assert_eq!(obj.object_id, "readme");
        assert_eq!(obj.to_string(), "document:readme");
    }

    #[test]
    fn test_object_parse_invalid() {
        assert!(ObjectRef::parse("invalid").is_err());
        assert!(ObjectRef::parse(":id").is_err());
        assert!(ObjectRef::parse("type:").is_err());
    }

    #[test]
    fn test_user_parse_variants() {
        assert_eq!(
            UserRef::parse("user:alice").unwrap(),
            UserRef::Object {
                user_type: "user".to_string(),
                user_id: "alice".to_string(),
            }
        );
        assert_eq!(
            UserRef::parse("user:*").unwrap(),
            UserRef::Wildcard {
                user_type: "user".to_string(),
            }
        );
        assert_eq!(
            UserRef::parse("group:eng#member").unwrap(),
            UserRef::Userset {
                user_type: "group".to_string(),
                user_id: "eng".to_string(),
                relation: "member".to_string(),
            }
        );
    }

    #[test]
    fn test_user_parse_invalid() {
        assert!(UserRef::parse("alice").is_err());
        assert!(UserRef::parse("user:").is_err());
        assert!(UserRef::parse("group:eng#").is_err());
        // A wildcard cannot carry a userset relation.
        assert!(UserRef::parse("user:*#member").is_err());
    }

    #[test]
    fn test_tuple_key_validate_format() {
        assert!(TupleKey::new("document:readme", "viewer", "user:alice")
            .validate_format()
            .is_ok());
        assert!(TupleKey::new("document", "viewer", "user:alice")
            .validate_format()
            .is_err());
        assert!(TupleKey::new("document:readme", "", "user:alice")
            .validate_format()
            .is_err());
    }

    #[test]
    fn test_has_intersection_or_exclusion() {
        let plain = Userset::Union {
            children: vec![
                Userset::This,
                Userset::ComputedUserset {
                    relation: "editor".to_string(),
                },
            ],
        };
        assert!(!plain.has_intersection_or_exclusion());

        let with_exclusion = Userset::Union {
            children: vec![
                Userset::This,
                Userset::Exclusion {
                    base: Box::new(Userset::This),
                    subtract: Box::new(Userset::ComputedUserset {
                        relation: "banned".to_string(),
                    }),
                },
            ],
        };
        assert!(with_exclusion.has_intersection_or_exclusion());
    }
}
