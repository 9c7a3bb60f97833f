use crate::{Relation, Result, Rule, RuleRef, RuleScope, RuleType, SearchFields};
use async_trait::async_trait;

/// Keyed read access to the rule tiers and their relations.
///
/// This is the only storage surface the engine depends on; mutations happen
/// elsewhere and are reported to the engine as `MutationEvent`s.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rule(&self, rule: RuleRef) -> Result<Option<Rule>>;

    async fn get_rule_by_name(&self, name: &str, rule_type: RuleType) -> Result<Option<Rule>>;

    /// Outgoing relations of `parent`, ordered by
    /// `(order_index asc, weight desc, relation id asc)`
    async fn list_children(&self, parent: RuleRef) -> Result<Vec<Relation>>;

    /// Rules in scope ordered by tier, then id
    async fn list_rules(&self, scope: RuleScope) -> Result<Vec<Rule>>;

    async fn list_relations(&self) -> Result<Vec<Relation>>;

    /// Case-insensitive substring match over the selected fields
    async fn search_rules(
        &self,
        query: &str,
        fields: SearchFields,
        scope: RuleScope,
    ) -> Result<Vec<Rule>>;
}

/// Write-path notification consumed by cache invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    RuleCreated { rule: RuleRef, name: String },
    RuleUpdated { rule: RuleRef, name: String },
    RuleDeleted { rule: RuleRef, name: String },
    RelationCreated { parent: RuleRef, child: RuleRef },
    RelationDeleted { parent: RuleRef, child: RuleRef },
    /// Bulk change such as a snapshot import
    Reloaded,
}
