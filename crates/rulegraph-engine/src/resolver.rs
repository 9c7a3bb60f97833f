use futures::future::BoxFuture;
use rulegraph_core::{
    Relation, RelationId, RenderContext, Result, Rule, RuleGraphError, RuleRef, RuleStore, RuleType,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One rule in a resolved tree, with the edge that reached it
#[derive(Debug, Clone)]
pub struct HierarchyNode {
    pub rule: Rule,
    /// `None` for the root
    pub edge: Option<Relation>,
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    pub fn rule_ref(&self) -> RuleRef {
        self.rule.rule_ref()
    }

    fn local_override(&self) -> RenderContext {
        self.edge
            .as_ref()
            .map(|edge| edge.context_override.clone())
            .unwrap_or_default()
    }
}

/// Optional dependency left out of a resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDependency {
    pub parent: RuleRef,
    pub child: RuleRef,
    pub relation_id: RelationId,
    pub reason: String,
}

/// Dependency tree rooted at the requested rule
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub root: HierarchyNode,
    pub skipped: Vec<SkippedDependency>,
}

impl Hierarchy {
    /// Rules in depth-first pre-order, each listed once
    pub fn rules_used(&self) -> Vec<RuleRef> {
        fn walk(node: &HierarchyNode, seen: &mut HashSet<RuleRef>, out: &mut Vec<RuleRef>) {
            if seen.insert(node.rule_ref()) {
                out.push(node.rule_ref());
            }
            for child in &node.children {
                walk(child, seen, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.root, &mut HashSet::new(), &mut out);
        out
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &HierarchyNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

/// One template ready for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub rule: RuleRef,
    pub rule_type: RuleType,
    pub rule_name: String,
    pub template: String,
    /// Distance from the root
    pub depth: usize,
    /// Number of fragments directly below this one in the tree
    pub child_count: usize,
    /// Override carried by the edge that reached this rule
    pub local_override: RenderContext,
    /// Overrides along the root-to-here path, nearer edges winning
    pub effective_override: RenderContext,
    /// Task attributes inherited from the nearest task ancestor (or self)
    pub attributes: RenderContext,
}

/// Ordered fragments of a hierarchy, leaves before their parent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedContent {
    pub fragments: Vec<Fragment>,
    /// Union of every edge override; deeper edges win on collision
    pub overrides: RenderContext,
    pub rules_used: Vec<RuleRef>,
}

/// Builds dependency trees from the store.
///
/// Edges are followed in `(order_index, weight desc, relation id)` order. An
/// edge pointing back onto the current path is a cycle and aborts the whole
/// resolution, regardless of `is_required`.
#[derive(Clone)]
pub struct RuleResolver {
    store: Arc<dyn RuleStore>,
}

impl RuleResolver {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, root: RuleRef) -> Result<Hierarchy> {
        let rule = self
            .store
            .get_rule(root)
            .await?
            .ok_or_else(|| RuleGraphError::NotFound(format!("rule {}", root)))?;

        let mut path = Vec::new();
        let mut skipped = Vec::new();
        let root = self.resolve_node(rule, None, &mut path, &mut skipped).await?;

        debug!("Resolved {} with {} skipped dependencies", root.rule_ref(), skipped.len());
        Ok(Hierarchy { root, skipped })
    }

    fn resolve_node<'a>(
        &'a self,
        rule: Rule,
        edge: Option<Relation>,
        path: &'a mut Vec<RuleRef>,
        skipped: &'a mut Vec<SkippedDependency>,
    ) -> BoxFuture<'a, Result<HierarchyNode>> {
        Box::pin(async move {
            let current = rule.rule_ref();
            path.push(current);

            let mut relations = self.store.list_children(current).await?;
            relations.sort_by(Relation::sibling_order);

            let mut children = Vec::with_capacity(relations.len());
            for relation in relations {
                if let Some(start) = path.iter().position(|r| *r == relation.child) {
                    let mut cycle = path[start..].to_vec();
                    cycle.push(relation.child);
                    return Err(RuleGraphError::CyclicDependency { path: cycle });
                }

                let child_ref = relation.child;
                let Some(child) = self.store.get_rule(child_ref).await? else {
                    let reason = format!("child rule {} does not exist", child_ref);
                    if relation.is_required {
                        return Err(RuleGraphError::Dependency {
                            rule: current,
                            reason,
                        });
                    }
                    skip(skipped, &relation, reason);
                    continue;
                };

                let depth = path.len();
                let is_required = relation.is_required;
                let outcome = self
                    .resolve_node(child, Some(relation.clone()), path, skipped)
                    .await;
                path.truncate(depth);

                match outcome {
                    Ok(node) => children.push(node),
                    Err(err @ RuleGraphError::CyclicDependency { .. }) => return Err(err),
                    Err(err)
                        if !is_required
                            && matches!(
                                err,
                                RuleGraphError::NotFound(_) | RuleGraphError::Dependency { .. }
                            ) =>
                    {
                        skip(skipped, &relation, err.to_string());
                    }
                    Err(err) => return Err(err),
                }
            }

            path.pop();
            Ok(HierarchyNode {
                rule,
                edge,
                children,
            })
        })
    }

    /// Flatten a hierarchy into post-order fragments
    pub fn merge(hierarchy: &Hierarchy) -> MergedContent {
        fn walk(
            node: &HierarchyNode,
            depth: usize,
            inherited_override: &RenderContext,
            inherited_attributes: &RenderContext,
            out: &mut Vec<Fragment>,
        ) {
            let local_override = node.local_override();
            let mut effective_override = inherited_override.clone();
            effective_override.extend(local_override.iter().map(|(k, v)| (k.clone(), v.clone())));

            let own_attributes = node.rule.attribute_variables();
            let attributes = if own_attributes.is_empty() {
                inherited_attributes.clone()
            } else {
                own_attributes
            };

            for child in &node.children {
                walk(child, depth + 1, &effective_override, &attributes, out);
            }

            out.push(Fragment {
                rule: node.rule_ref(),
                rule_type: node.rule.rule_type,
                rule_name: node.rule.name.clone(),
                template: node.rule.template.clone(),
                depth,
                child_count: node.children.len(),
                local_override,
                effective_override,
                attributes,
            });
        }

        let mut fragments = Vec::new();
        walk(
            &hierarchy.root,
            0,
            &RenderContext::new(),
            &RenderContext::new(),
            &mut fragments,
        );

        // Stable sort keeps traversal order among equal depths
        let mut by_depth: Vec<&Fragment> = fragments.iter().collect();
        by_depth.sort_by_key(|f| f.depth);
        let mut overrides = RenderContext::new();
        for fragment in by_depth {
            overrides.extend(
                fragment
                    .local_override
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }

        MergedContent {
            fragments,
            overrides,
            rules_used: hierarchy.rules_used(),
        }
    }
}

fn skip(skipped: &mut Vec<SkippedDependency>, relation: &Relation, reason: String) {
    warn!(
        "Skipping optional dependency {} -> {}: {}",
        relation.parent, relation.child, reason
    );
    skipped.push(SkippedDependency {
        parent: relation.parent,
        child: relation.child,
        relation_id: relation.id,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulegraph_core::{MemoryRuleStore, NewRelation, NewRule};

    fn store_with_chain() -> (Arc<MemoryRuleStore>, RuleRef, RuleRef, RuleRef) {
        let store = Arc::new(MemoryRuleStore::new());
        let (p, _) = store
            .create_rule(RuleType::Primitive, NewRule::new("P1", "Be concise.").with_category("instruction"))
            .unwrap();
        let (s, _) = store
            .create_rule(RuleType::Semantic, NewRule::new("S1", "{{tone}}: {{primitive}}"))
            .unwrap();
        let (t, _) = store
            .create_rule(RuleType::Task, NewRule::new("T1", "Task: {{semantic}}"))
            .unwrap();
        store
            .create_relation(NewRelation::new(s.rule_ref(), p.rule_ref()).with_override("tone", "formal"))
            .unwrap();
        store
            .create_relation(NewRelation::new(t.rule_ref(), s.rule_ref()))
            .unwrap();
        (store, t.rule_ref(), s.rule_ref(), p.rule_ref())
    }

    #[tokio::test]
    async fn test_resolve_and_merge_post_order() {
        let (store, t, s, p) = store_with_chain();
        let resolver = RuleResolver::new(store);
        let hierarchy = resolver.resolve(t).await.unwrap();
        assert_eq!(hierarchy.node_count(), 3);
        assert_eq!(hierarchy.rules_used(), vec![t, s, p]);

        let merged = RuleResolver::merge(&hierarchy);
        let order: Vec<_> = merged.fragments.iter().map(|f| f.rule).collect();
        assert_eq!(order, vec![p, s, t]);
        assert_eq!(merged.fragments[0].depth, 2);
        assert_eq!(merged.fragments[2].child_count, 1);
        assert_eq!(merged.overrides.get("tone").map(String::as_str), Some("formal"));
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let resolver = RuleResolver::new(Arc::new(MemoryRuleStore::new()));
        let err = resolver
            .resolve(RuleRef::new(RuleType::Task, 42))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleGraphError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deeper_override_wins_in_union() {
        let (store, t, s, _) = store_with_chain();
        // Task -> semantic edge also sets tone; the deeper semantic -> primitive edge wins
        let relation = store
            .list_children(t)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        store.delete_relation(relation.id).unwrap();
        store
            .create_relation(NewRelation::new(t, s).with_override("tone", "casual"))
            .unwrap();

        let hierarchy = RuleResolver::new(store).resolve(t).await.unwrap();
        let merged = RuleResolver::merge(&hierarchy);
        assert_eq!(merged.overrides["tone"], "formal");
        let semantic = merged.fragments.iter().find(|f| f.rule == s).unwrap();
        assert_eq!(semantic.effective_override["tone"], "casual");
    }
}
