//! warden-storage: Storage abstraction layer
//!
//! This crate provides the storage abstraction for warden, including:
//! - `DataStore` trait for stores, tuples, models, changelog, and assertions
//! - In-memory implementation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              warden-storage                  │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - DataStore trait definition   │
//! │  memory.rs   - In-memory implementation     │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::MemoryDataStore;
pub use traits::{
    parse_user_filter, validate_store_id, validate_store_name, validate_tuple, Assertion,
    ChangeOperation, DataStore, PaginatedResult, PaginationOptions, Store,
    StoredAuthorizationModel, StoredTuple, TupleChange, TupleFilter,
};

// Re-export chrono types for timestamp handling
pub use chrono::{DateTime, Utc};
