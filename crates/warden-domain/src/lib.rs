//! warden-domain: Core authorization domain logic
//!
//! This crate contains the query-resolution engine:
//! - Authorization model types and the type system over them
//! - Condition (CEL) evaluation
//! - The check-resolver pipeline: local graph walker, result cache,
//!   dispatch throttler, tracker
//! - The constant-rate throttler primitive
//! - Expand, ListObjects, and ListUsers query engines
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 warden-domain                    │
//! ├─────────────────────────────────────────────────┤
//! │  model/        - Model types & type system      │
//! │  condition     - CEL condition evaluation       │
//! │  reader        - Tuple read traits & wrappers   │
//! │  resolver/     - Check resolver pipeline        │
//! │  throttler     - Constant-rate ticket source    │
//! │  expand        - Userset tree expansion         │
//! │  list_objects  - Reverse expansion + check      │
//! │  list_users    - Forward user enumeration       │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod condition;
pub mod error;
pub mod expand;
pub mod list_objects;
pub mod list_users;
pub mod model;
pub mod reader;
pub mod resolver;
pub mod throttler;

// Re-export commonly used types at the crate root
pub use error::{DomainError, DomainResult};
pub use model::{AuthorizationModel, TupleKey, TypeSystem, TypesystemResolver};
pub use resolver::{
    CheckResolver, CheckResolverBuilder, ConsistencyPreference, ResolveCheckRequest,
    ResolveCheckResponse,
};
