//! Per-RPC command logic that is heavy enough to live outside the facade.

mod write;

pub use write::WriteCommand;
