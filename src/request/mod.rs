//! Request aggregate - domain model and state transitions.

pub mod transitions;
pub mod types;

pub use transitions::RequestCompletionResult;
pub use types::*;
