use crate::{Result, RuleGraphError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type RuleId = i64;
pub type RelationId = i64;

/// Caller-supplied variables; ordered so that it canonicalizes for hashing
pub type RenderContext = BTreeMap<String, String>;

/// The three rule tiers, leaves first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Primitive,
    Semantic,
    Task,
}

impl RuleType {
    pub const ALL: [RuleType; 3] = [RuleType::Primitive, RuleType::Semantic, RuleType::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primitive => "primitive",
            Self::Semantic => "semantic",
            Self::Task => "task",
        }
    }

    /// Tier a rule of this type may depend on
    pub fn child_type(&self) -> Option<RuleType> {
        match self {
            Self::Task => Some(Self::Semantic),
            Self::Semantic => Some(Self::Primitive),
            Self::Primitive => None,
        }
    }

    /// Name of the template column in the relational schema
    pub fn template_field(&self) -> &'static str {
        match self {
            Self::Primitive => "content",
            Self::Semantic => "content_template",
            Self::Task => "prompt_template",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = RuleGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primitive" => Ok(Self::Primitive),
            "semantic" => Ok(Self::Semantic),
            "task" => Ok(Self::Task),
            other => Err(RuleGraphError::InvalidOperation(format!(
                "Unknown rule type: {}. Must be one of: primitive, semantic, task",
                other
            ))),
        }
    }
}

/// Either every tier or a single one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleScope {
    #[default]
    All,
    Only(RuleType),
}

impl RuleScope {
    pub fn includes(&self, rule_type: RuleType) -> bool {
        match self {
            Self::All => true,
            Self::Only(t) => *t == rule_type,
        }
    }

    pub fn types(&self) -> Vec<RuleType> {
        match self {
            Self::All => RuleType::ALL.to_vec(),
            Self::Only(t) => vec![*t],
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(t) => write!(f, "{}", t),
        }
    }
}

impl FromStr for RuleScope {
    type Err = RuleGraphError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            Ok(Self::Only(s.parse()?))
        }
    }
}

/// Identifies a rule across tiers, rendered as `tier:id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RuleRef {
    pub rule_type: RuleType,
    pub id: RuleId,
}

impl RuleRef {
    pub fn new(rule_type: RuleType, id: RuleId) -> Self {
        Self { rule_type, id }
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rule_type, self.id)
    }
}

impl FromStr for RuleRef {
    type Err = RuleGraphError;

    fn from_str(s: &str) -> Result<Self> {
        let (tier, id) = s.split_once(':').ok_or_else(|| {
            RuleGraphError::InvalidOperation(format!("Invalid rule reference: {}", s))
        })?;
        let id = id.trim().parse::<RuleId>().map_err(|_| {
            RuleGraphError::InvalidOperation(format!("Invalid rule id in reference: {}", s))
        })?;
        Ok(Self::new(tier.parse()?, id))
    }
}

impl From<RuleRef> for String {
    fn from(value: RuleRef) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for RuleRef {
    type Error = RuleGraphError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Allowed categories for primitive rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveCategory {
    Instruction,
    Format,
    Constraint,
    Pattern,
}

impl PrimitiveCategory {
    pub const ALL: [PrimitiveCategory; 4] = [
        PrimitiveCategory::Instruction,
        PrimitiveCategory::Format,
        PrimitiveCategory::Constraint,
        PrimitiveCategory::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Format => "format",
            Self::Constraint => "constraint",
            Self::Pattern => "pattern",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

/// A stored rule of any tier.
///
/// The tiers share one shape; the template column is named differently per
/// tier in the relational schema, which the serde aliases accept on import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub rule_type: RuleType,
    pub name: String,
    #[serde(alias = "content", alias = "content_template", alias = "prompt_template")]
    pub template: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Raw category text; primitive rules must hold a `PrimitiveCategory` value
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    /// Documented template variables
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Rule {
    pub fn rule_ref(&self) -> RuleRef {
        RuleRef::new(self.rule_type, self.id)
    }

    /// Task attributes exposed to templates as variables
    pub fn attribute_variables(&self) -> RenderContext {
        let mut vars = RenderContext::new();
        if self.rule_type != RuleType::Task {
            return vars;
        }
        for (key, value) in [
            ("language", &self.language),
            ("framework", &self.framework),
            ("domain", &self.domain),
        ] {
            if let Some(value) = value {
                vars.insert(key.to_string(), value.clone());
            }
        }
        vars
    }
}

/// Input for creating a rule; storage assigns id, version and timestamps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub variables: Vec<String>,
}

impl NewRule {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = variables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task_attributes(
        mut self,
        language: Option<&str>,
        framework: Option<&str>,
        domain: Option<&str>,
    ) -> Self {
        self.language = language.map(str::to_string);
        self.framework = framework.map(str::to_string);
        self.domain = domain.map(str::to_string);
        self
    }
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub template: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub domain: Option<String>,
    pub variables: Option<Vec<String>>,
}

/// Weighted, ordered edge from a parent rule to a child it depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub parent: RuleRef,
    pub child: RuleRef,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub order_index: i32,
    #[serde(default = "default_required")]
    pub is_required: bool,
    /// Merged into the child's render context for this edge only
    #[serde(default)]
    pub context_override: RenderContext,
}

fn default_weight() -> f64 {
    1.0
}

fn default_required() -> bool {
    true
}

impl Relation {
    /// Sibling ordering: order index, then heavier first, then relation id
    pub fn sibling_order(a: &Relation, b: &Relation) -> std::cmp::Ordering {
        a.order_index
            .cmp(&b.order_index)
            .then_with(|| b.weight.total_cmp(&a.weight))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Input for creating a relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRelation {
    pub parent: RuleRef,
    pub child: RuleRef,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub order_index: i32,
    #[serde(default = "default_required")]
    pub is_required: bool,
    #[serde(default)]
    pub context_override: RenderContext,
}

impl NewRelation {
    pub fn new(parent: RuleRef, child: RuleRef) -> Self {
        Self {
            parent,
            child,
            weight: default_weight(),
            order_index: 0,
            is_required: true,
            context_override: RenderContext::new(),
        }
    }

    pub fn order(mut self, order_index: i32) -> Self {
        self.order_index = order_index;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_override.insert(key.into(), value.into());
        self
    }
}

/// Rule fields a search may match against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchFields {
    Name,
    #[default]
    Content,
    Description,
    All,
}

impl SearchFields {
    pub fn name(&self) -> bool {
        matches!(self, Self::Name | Self::All)
    }

    pub fn content(&self) -> bool {
        matches!(self, Self::Content | Self::All)
    }

    pub fn description(&self) -> bool {
        matches!(self, Self::Description | Self::All)
    }
}

impl FromStr for SearchFields {
    type Err = RuleGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "content" | "template" => Ok(Self::Content),
            "description" | "metadata" => Ok(Self::Description),
            "all" => Ok(Self::All),
            other => Err(RuleGraphError::InvalidOperation(format!(
                "Unknown search type: {}. Must be one of: name, content, description, all",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_ref_round_trips_as_string() {
        let r = RuleRef::new(RuleType::Task, 7);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"task:7\"");
        let back: RuleRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!("task".parse::<RuleRef>().is_err());
        assert!("widget:1".parse::<RuleRef>().is_err());
    }

    #[test]
    fn test_child_types_follow_tier_order() {
        assert_eq!(RuleType::Task.child_type(), Some(RuleType::Semantic));
        assert_eq!(RuleType::Semantic.child_type(), Some(RuleType::Primitive));
        assert_eq!(RuleType::Primitive.child_type(), None);
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("all".parse::<RuleScope>().unwrap(), RuleScope::All);
        assert_eq!(
            "Semantic".parse::<RuleScope>().unwrap(),
            RuleScope::Only(RuleType::Semantic)
        );
        assert!("everything".parse::<RuleScope>().is_err());
    }

    #[test]
    fn test_sibling_order_breaks_ties_by_weight_then_id() {
        let parent = RuleRef::new(RuleType::Task, 1);
        let child = RuleRef::new(RuleType::Semantic, 1);
        let rel = |id, order, weight| Relation {
            id,
            parent,
            child,
            weight,
            order_index: order,
            is_required: true,
            context_override: RenderContext::new(),
        };
        let mut rels = vec![rel(3, 1, 1.0), rel(2, 0, 0.5), rel(1, 0, 2.0), rel(4, 1, 1.0)];
        rels.sort_by(Relation::sibling_order);
        let ids: Vec<_> = rels.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rule_accepts_tier_column_names() {
        let json = r#"{"id": 3, "rule_type": "semantic", "name": "tone", "content_template": "{{tone}}"}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.template, "{{tone}}");
        assert_eq!(rule.version, 1);
    }
}
