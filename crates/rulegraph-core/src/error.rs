use crate::RuleRef;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Rule name '{name}' is ambiguous across tiers: {}", .tiers.join(", "))]
    AmbiguousRule { name: String, tiers: Vec<String> },

    #[error("Cyclic dependency detected: {}", format_path(.path))]
    CyclicDependency { path: Vec<RuleRef> },

    #[error("Dependency error in {rule}: {reason}")]
    Dependency { rule: RuleRef, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RuleGraphError>;

/// Stable, transport-independent classification of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    CyclicDependency,
    Dependency,
    Storage,
    InvalidOperation,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::CyclicDependency => "cyclic_dependency",
            Self::Dependency => "dependency",
            Self::Storage => "storage",
            Self::InvalidOperation => "invalid_operation",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl RuleGraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::AmbiguousRule { .. } => ErrorKind::NotFound,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Self::Dependency { .. } => ErrorKind::Dependency,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Unknown or ambiguous rule references; user input errors
    pub fn is_not_found_class(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

fn format_path(path: &[RuleRef]) -> String {
    path.iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
