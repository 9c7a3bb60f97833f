use crate::PromptCache;
use rulegraph_core::{MutationEvent, RuleRef};
use tracing::{debug, info};

/// Tag carried by every cached prompt that consumed `rule`
pub fn rule_tag(rule: RuleRef) -> String {
    format!("rule:{}", rule)
}

/// Tag carried by every cached prompt requested under `name`
pub fn name_tag(name: &str) -> String {
    format!("name:{}", name)
}

/// What a mutation makes stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    Tags(Vec<String>),
    Everything,
}

impl InvalidationScope {
    /// Map a write-path event to the cache entries it affects.
    ///
    /// A changed rule stales every prompt built from it. Creating or renaming
    /// a rule can change what a bare name resolves to, so the name tag goes
    /// too. Edge changes stale the prompts that consumed the parent.
    pub fn for_event(event: &MutationEvent) -> Self {
        match event {
            MutationEvent::RuleCreated { name, .. } => Self::Tags(vec![name_tag(name)]),
            MutationEvent::RuleUpdated { rule, name } | MutationEvent::RuleDeleted { rule, name } => {
                Self::Tags(vec![rule_tag(*rule), name_tag(name)])
            }
            MutationEvent::RelationCreated { parent, .. }
            | MutationEvent::RelationDeleted { parent, .. } => Self::Tags(vec![rule_tag(*parent)]),
            MutationEvent::Reloaded => Self::Everything,
        }
    }
}

/// Apply the invalidation for `event` to `cache`, returning how many entries were dropped
pub fn invalidate_for_event<V: Clone>(cache: &PromptCache<V>, event: &MutationEvent) -> usize {
    let removed = match InvalidationScope::for_event(event) {
        InvalidationScope::Everything => {
            info!("Rule set reloaded; clearing prompt cache");
            cache.invalidate(None)
        }
        InvalidationScope::Tags(tags) => tags.iter().map(|tag| cache.invalidate_tag(tag)).sum(),
    };
    debug!("{:?} invalidated {} cached prompts", event, removed);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulegraph_core::RuleType;

    #[test]
    fn test_rule_update_targets_rule_and_name() {
        let rule = RuleRef::new(RuleType::Primitive, 4);
        let scope = InvalidationScope::for_event(&MutationEvent::RuleUpdated {
            rule,
            name: "concise".into(),
        });
        assert_eq!(
            scope,
            InvalidationScope::Tags(vec!["rule:primitive:4".into(), "name:concise".into()])
        );
    }

    #[test]
    fn test_relation_change_targets_parent() {
        let parent = RuleRef::new(RuleType::Semantic, 1);
        let child = RuleRef::new(RuleType::Primitive, 2);
        assert_eq!(
            InvalidationScope::for_event(&MutationEvent::RelationDeleted { parent, child }),
            InvalidationScope::Tags(vec![rule_tag(parent)])
        );
    }

    #[test]
    fn test_reload_clears_everything() {
        let cache: PromptCache<String> = PromptCache::default();
        cache.set("a", "1".into(), None);
        cache.set("b", "2".into(), None);
        assert_eq!(invalidate_for_event(&cache, &MutationEvent::Reloaded), 2);
        assert!(cache.is_empty());
    }
}
