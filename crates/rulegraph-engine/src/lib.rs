pub mod analysis;
pub mod engine;
pub mod resolver;
pub mod search;
pub mod template;
pub mod validation;

pub use analysis::{
    AnalysisResult, EngineMetrics, Impact, OptimizationReport, OptimizationType,
    PerformanceMetrics, Relationship, RuleDependencies, Suggestion, SuggestionKind,
};
pub use engine::*;
pub use resolver::*;
pub use search::{SearchHit, SearchRequest, SearchResults};
pub use template::{Formatted, RenderedPrompt, TemplateRenderer};
pub use validation::*;

pub use rulegraph_core::{Result, RuleGraphError};
