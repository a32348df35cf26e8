//! Authorization model types and the type system built over them.

mod type_system;
mod types;

pub use type_system::{AuthorizationModelReader, TypeSystem, TypesystemResolver};
pub use types::{
    AuthorizationModel, Condition, ContextualTuple, ObjectRef, RelationDefinition, TupleKey,
    TypeConstraint, TypeDefinition, UserRef, Userset,
};
