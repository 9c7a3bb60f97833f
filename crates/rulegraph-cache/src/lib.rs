pub mod cache;
pub mod invalidation;
pub mod prompt_cache;

pub use cache::*;
pub use invalidation::*;
pub use prompt_cache::*;

// Re-export common types for convenience
pub use rulegraph_core::{MutationEvent, RuleGraphError, RuleRef, Result};
