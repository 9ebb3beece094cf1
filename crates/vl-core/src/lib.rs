//! # vl-core
//!
//! Shared building blocks for the venue link client:
//!
//! - **Types** (`types`): connection state, output channels, classified messages
//! - **Configuration** (`config`): JSON config deserialization + reconnect policy
//! - **Error types** (`error`): `ClientError` / `DecodeError` via thiserror
//! - **Deduplication** (`dedup`): epoch-scoped notification token set
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod types;

// Re-export types at crate root for convenience.
pub use error::{ClientError, DecodeError};
pub use types::*;
