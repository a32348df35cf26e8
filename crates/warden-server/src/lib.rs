//! warden-server: the service facade
//!
//! This crate stitches the domain engine and the storage layer into the
//! warden service backend:
//! - `Server` - request validation, type-system resolution, resolver-stack
//!   assembly, per-RPC orchestration, telemetry
//! - `Authorizer` - the self-authorization gate (FGA-on-FGA)
//! - configuration, the server error taxonomy, continuation-token
//!   encoding, and the storage-to-domain adapters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               warden-server                  │
//! ├─────────────────────────────────────────────┤
//! │  server.rs   - Service facade               │
//! │  authz.rs    - Self-authorization gate      │
//! │  commands/   - Heavy per-RPC commands       │
//! │  adapters.rs - DataStore → domain traits    │
//! │  config.rs   - Configuration management     │
//! │  errors.rs   - Error taxonomy               │
//! │  encoder.rs  - Continuation tokens          │
//! │  gateway.rs  - Response header seam         │
//! └─────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod authz;
pub mod commands;
pub mod config;
pub mod context;
pub mod encoder;
pub mod errors;
pub mod gateway;
pub mod server;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigLoadError, ServerConfig};
pub use context::{AuthClaims, RequestContext};
pub use errors::{ErrorCode, ServerError, ServerResult};
pub use server::Server;
