//! vgate-core: shared types for the console gateway.
//!
//! Provides access tokens, the static target registry, WebSocket close
//! codes, and the workspace error type.

pub mod close;
pub mod error;
pub mod registry;
pub mod token;

// Re-export commonly used items at crate root.
pub use close::CloseReason;
pub use error::{GateError, GateResult};
pub use registry::{TargetEntry, TargetRegistry};
pub use token::{generate_token_value, token_prefix, unix_millis, Token};
